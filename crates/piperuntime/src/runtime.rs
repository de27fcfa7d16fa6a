use crate::batch::{BatchReport, BatchRunner, RunDescriptor};
use crate::executor::{ExecutionResult, PipelineExecutor};
use crate::graph::{self, Edge, EdgeKind, GraphNode};
use crate::registry::TaskRegistry;
use petgraph::graph::DiGraph;
use pipecore::{
    BatchError, DataStore, EventBus, ExecutionEvent, MetadataSink, NotFoundError, PipeError,
    Pipeline, PipelineDef, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Main runtime: builds pipelines from the registry, runs them and runs batches
pub struct PipelineRuntime {
    config: RuntimeConfig,
    registry: Arc<TaskRegistry>,
    executor: PipelineExecutor,
    event_bus: Arc<EventBus>,
    data: Option<Arc<dyn DataStore>>,
    sink: Option<Arc<dyn MetadataSink>>,
}

/// A pipeline after it has been run, kept for inspection
pub struct CompletedRun {
    pub pipeline: Pipeline,
    pub result: ExecutionResult,
}

impl PipelineRuntime {
    /// Create a new runtime with an empty registry and default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(TaskRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<TaskRegistry>, config: RuntimeConfig) -> Self {
        let executor = PipelineExecutor::new(config.max_parallel_nodes);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            config,
            registry,
            executor,
            event_bus,
            data: None,
            sink: None,
        }
    }

    /// Data store shared by pipeline nodes and batch invocations
    pub fn with_data_store(mut self, data: Arc<dyn DataStore>) -> Self {
        self.executor = PipelineExecutor::new(self.config.max_parallel_nodes)
            .with_data_store(Arc::clone(&data));
        self.data = Some(data);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Execute an already built pipeline from its root
    pub async fn execute(&self, pipeline: &Pipeline, input: Value) -> Result<ExecutionResult, PipeError> {
        self.executor.execute(pipeline, &self.event_bus, input).await
    }

    /// Build and run a registered composite
    pub async fn run_named(&self, name: &str, input: Value) -> Result<CompletedRun, PipeError> {
        let def = self.registry.composite(name)?.clone();
        self.run_definition(&def, input).await
    }

    /// Build and run a pipeline definition
    pub async fn run_definition(&self, def: &PipelineDef, input: Value) -> Result<CompletedRun, PipeError> {
        let pipeline = self.registry.build(def)?;
        let max_parallel = def
            .settings
            .max_parallel_nodes
            .min(self.config.max_parallel_nodes);
        let mut executor = PipelineExecutor::new(max_parallel);
        if let Some(data) = &self.data {
            executor = executor.with_data_store(Arc::clone(data));
        }

        let result = executor.execute(&pipeline, &self.event_bus, input).await?;
        Ok(CompletedRun { pipeline, result })
    }

    pub fn list_task_types(&self) -> Vec<String> {
        self.registry.list_task_types()
    }

    pub fn list_composites(&self) -> Vec<String> {
        self.registry.list_composites()
    }

    /// ASCII tree of a registered composite
    pub fn tree(&self, name: &str) -> Result<String, PipeError> {
        let pipeline = self.registry.build_named(name)?;
        let root = root_of(&pipeline)?;
        Ok(graph::ascii_tree(&pipeline, root))
    }

    /// Edge list of a registered composite
    pub fn edges(&self, name: &str) -> Result<Vec<Edge>, PipeError> {
        let pipeline = self.registry.build_named(name)?;
        let root = root_of(&pipeline)?;
        Ok(graph::edge_list(&pipeline, root))
    }

    pub fn graph(&self, name: &str) -> Result<DiGraph<GraphNode, EdgeKind>, PipeError> {
        let pipeline = self.registry.build_named(name)?;
        let root = root_of(&pipeline)?;
        Ok(graph::to_graph(&pipeline, root))
    }

    /// Run one task type over many targets
    pub async fn run_batch(&self, desc: RunDescriptor) -> Result<BatchReport, BatchError> {
        let mut runner =
            BatchRunner::new(Arc::clone(&self.registry)).with_event_bus(Arc::clone(&self.event_bus));
        if let Some(data) = &self.data {
            runner = runner.with_data_store(Arc::clone(data));
        }
        if let Some(sink) = &self.sink {
            runner = runner.with_metadata_sink(Arc::clone(sink));
        }
        runner.run(desc).await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn root_of(pipeline: &Pipeline) -> Result<pipecore::NodeId, NotFoundError> {
    pipeline
        .root()
        .ok_or_else(|| NotFoundError::Node(format!("root of '{}'", pipeline.name())))
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
        }
    }
}
