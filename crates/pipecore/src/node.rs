use crate::{events::EventEmitter, DataId, DataStore, Metadata, NodeError, Target, TaskConfig, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Kind tag carried by every node in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Sequential,
    Parallel,
}

impl NodeKind {
    pub fn is_composite(self) -> bool {
        !matches!(self, NodeKind::Task)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Task => "task",
            NodeKind::Sequential => "sequential",
            NodeKind::Parallel => "parallel",
        })
    }
}

/// Leaf unit of work.
///
/// `run` is the task's own work; `pre_run` and `post_run` are optional hooks.
/// None of them is called directly by the engine: execution always goes
/// through [`crate::run_with_lifecycle`].
#[async_trait]
pub trait Task: Send {
    /// Registered type identifier (e.g. "stats.mean")
    fn task_type(&self) -> &str;

    async fn pre_run(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError>;

    async fn post_run(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Output schemas keyed by dataset name. Persisted and compared once per
    /// batch, before any target runs.
    fn schemas(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// Per-node execution context: the input/output slots, configuration,
/// metadata and the collaborators a task may reach.
#[derive(Clone)]
pub struct NodeContext {
    /// Name within the parent scope
    pub name: String,

    /// Dotted name from the pipeline root
    pub full_name: String,

    pub config: TaskConfig,

    pub input: Value,

    pub output: Value,

    pub metadata: Metadata,

    /// Set when the node runs as part of a batch
    pub target: Option<Target>,

    pub data: Option<Arc<dyn DataStore>>,

    pub events: EventEmitter,

    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(name: impl Into<String>, config: TaskConfig) -> Self {
        let name = name.into();
        Self {
            full_name: name.clone(),
            events: EventEmitter::detached(name.clone()),
            name,
            config,
            input: Value::Null,
            output: Value::Null,
            metadata: Metadata::new(),
            target: None,
            data: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn data_id(&self) -> Option<&DataId> {
        self.target.as_ref().map(|t| &t.data_id)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.target.as_ref().and_then(|t| t.kwargs.get(key))
    }

    pub fn require_store(&self) -> Result<&Arc<dyn DataStore>, NodeError> {
        self.data
            .as_ref()
            .ok_or_else(|| NodeError::Configuration("no data store attached".to_string()))
    }

    /// Fetch `dataset` for the current target from the data store.
    pub async fn fetch(&self, dataset: &str) -> Result<Value, NodeError> {
        let data_id = self
            .data_id()
            .ok_or_else(|| NodeError::MissingInput("data id".to_string()))?;
        let store = self.require_store()?;
        let value = store.get(dataset, data_id).await?;
        value.ok_or_else(|| {
            NodeError::MissingInput(format!("{} for dataId={}", dataset, data_id))
        })
    }
}
