use crate::graph;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use pipecore::{
    run_with_lifecycle, Completion, DataStore, EventBus, ExecutionEvent, ExecutionId, Lifecycle,
    NodeCell, NodeContext, NodeError, NodeId, NodeKind, NodeSlot, NotFoundError, PipeError,
    Pipeline, TaskRun, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Executes composition trees, honouring sequential and parallel semantics
pub struct PipelineExecutor {
    max_parallel: usize,
    data: Option<Arc<dyn DataStore>>,
}

impl PipelineExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            data: None,
        }
    }

    /// Attach a data store to every node context that has none
    pub fn with_data_store(mut self, data: Arc<dyn DataStore>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Execute the pipeline from its root
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        event_bus: &EventBus,
        input: Value,
    ) -> Result<ExecutionResult, PipeError> {
        let root = pipeline
            .root()
            .ok_or_else(|| NotFoundError::Node(format!("root of '{}'", pipeline.name())))?;
        self.execute_from(pipeline, root, event_bus, input).await
    }

    /// Execute every node reachable from `root` exactly once.
    ///
    /// Nodes already marked complete are skipped, so executing the same tree
    /// twice without [`Pipeline::reset`] runs nothing the second time.
    pub async fn execute_from(
        &self,
        pipeline: &Pipeline,
        root: NodeId,
        event_bus: &EventBus,
        input: Value,
    ) -> Result<ExecutionResult, PipeError> {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();
        let root_name = pipeline.full_name(root);

        event_bus.emit(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline: pipeline.name().to_string(),
            timestamp: Utc::now(),
        });

        tracing::info!("Starting pipeline '{}' at '{}'", pipeline.name(), root_name);

        if !input.is_null() {
            pipeline.node(root)?.cell().lock().await.ctx.input = input;
        }

        let traversal = Traversal {
            pipeline,
            bus: event_bus,
            execution_id,
            max_parallel: self.max_parallel,
            data: self.data.clone(),
        };
        let result = traversal.run_node(root, Value::Null).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        event_bus.emit(ExecutionEvent::PipelineCompleted {
            execution_id,
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        let output = result?;
        let subtree = graph::flatten(pipeline, root);
        let completed_nodes = subtree
            .iter()
            .filter(|entry| pipeline.is_completed(entry.id))
            .count();

        tracing::info!(
            "Pipeline '{}' finished in {}ms ({}/{} nodes complete)",
            pipeline.name(),
            duration_ms,
            completed_nodes,
            subtree.len()
        );

        Ok(ExecutionResult {
            execution_id,
            output,
            completed_nodes,
            total_nodes: subtree.len(),
            duration_ms,
        })
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Result of one pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub output: Value,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub duration_ms: u64,
}

/// State shared by one walk over the tree
struct Traversal<'a> {
    pipeline: &'a Pipeline,
    bus: &'a EventBus,
    execution_id: ExecutionId,
    max_parallel: usize,
    data: Option<Arc<dyn DataStore>>,
}

impl<'a> Traversal<'a> {
    fn run_node<'s>(&'s self, id: NodeId, inherited: Value) -> BoxFuture<'s, Result<Value, NodeError>> {
        async move {
            let slot = self
                .pipeline
                .node(id)
                .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
            let full_name = self.pipeline.full_name(id);

            if slot.is_completed() {
                tracing::debug!("Skipping completed node '{}'", full_name);
                self.bus.emit(ExecutionEvent::NodeSkipped {
                    execution_id: self.execution_id,
                    node: full_name,
                    timestamp: Utc::now(),
                });
                return Ok(slot.cell().lock().await.ctx.output.clone());
            }

            self.bus.emit(ExecutionEvent::NodeStarted {
                execution_id: self.execution_id,
                node: full_name.clone(),
                kind: slot.kind(),
                timestamp: Utc::now(),
            });

            let start = Instant::now();
            let result = match slot.kind() {
                NodeKind::Task => self.run_task(slot, &full_name, inherited).await,
                NodeKind::Sequential | NodeKind::Parallel => {
                    let mut run = CompositeRun {
                        traversal: self,
                        id,
                        slot,
                        full_name: full_name.clone(),
                        inherited,
                        input: Value::Null,
                        outputs: HashMap::new(),
                    };
                    run_with_lifecycle(&mut run).await
                }
            };

            match &result {
                Ok(_) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!("Node '{}' completed in {}ms", full_name, duration_ms);
                    self.bus.emit(ExecutionEvent::NodeCompleted {
                        execution_id: self.execution_id,
                        node: full_name,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    tracing::error!("Node '{}' failed: {}", full_name, e);
                    self.bus.emit(ExecutionEvent::NodeFailed {
                        execution_id: self.execution_id,
                        node: full_name,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
            result
        }
        .boxed()
    }

    async fn run_task(&self, slot: &NodeSlot, full_name: &str, inherited: Value) -> Result<Value, NodeError> {
        let mut cell = slot.cell().lock().await;
        let NodeCell { task, ctx } = &mut *cell;
        self.prepare(ctx, full_name, inherited);

        let task = task.as_mut().ok_or_else(|| {
            NodeError::Configuration(format!("node '{}' has no task attached", full_name))
        })?;
        let mut run = TaskRun::new(task.as_mut(), ctx, slot.completion());
        run_with_lifecycle(&mut run).await
    }

    fn prepare(&self, ctx: &mut NodeContext, full_name: &str, inherited: Value) {
        ctx.full_name = full_name.to_string();
        ctx.events = self.bus.create_emitter(self.execution_id, full_name);
        if ctx.data.is_none() {
            ctx.data = self.data.clone();
        }
        if ctx.input.is_null() {
            ctx.input = inherited;
        }
    }
}

/// Lifecycle binding of a composite: its `do_run` is the traversal of its children.
struct CompositeRun<'s, 'a> {
    traversal: &'s Traversal<'a>,
    id: NodeId,
    slot: &'s NodeSlot,
    full_name: String,
    inherited: Value,
    input: Value,
    outputs: HashMap<String, Value>,
}

impl CompositeRun<'_, '_> {
    /// Head first, then along the successor chain.
    async fn run_chain(&mut self) -> Result<(), NodeError> {
        let slot = self.slot;
        let chain = slot.chain().ok_or_else(|| {
            NodeError::Configuration(format!("'{}' has no successor chain", self.full_name))
        })?;

        let mut next = chain.head();
        while let Some(child) = next {
            let output = self.traversal.run_node(child, self.input.clone()).await?;
            let name = self.child_name(child);
            self.outputs.insert(name, output);
            next = chain.successor(child);
        }
        Ok(())
    }

    /// Every member at once, bounded by the executor's parallelism.
    async fn run_members(&mut self) -> Result<(), NodeError> {
        let traversal = self.traversal;
        let members = traversal.pipeline.children(self.id);
        let input = self.input.clone();

        let outputs: Vec<(NodeId, Value)> = stream::iter(members)
            .map(|child| {
                let input = input.clone();
                async move {
                    let output = traversal.run_node(child, input).await?;
                    Ok::<_, NodeError>((child, output))
                }
            })
            .buffer_unordered(traversal.max_parallel)
            .try_collect()
            .await?;

        for (child, output) in outputs {
            let name = self.child_name(child);
            self.outputs.insert(name, output);
        }
        Ok(())
    }

    fn child_name(&self, child: NodeId) -> String {
        self.traversal
            .pipeline
            .node(child)
            .map(|slot| slot.name().to_string())
            .unwrap_or_else(|_| child.to_string())
    }
}

#[async_trait::async_trait]
impl Lifecycle for CompositeRun<'_, '_> {
    fn completion(&self) -> &Completion {
        self.slot.completion()
    }

    async fn pre_run(&mut self) -> Result<(), NodeError> {
        let mut cell = self.slot.cell().lock().await;
        let inherited = std::mem::take(&mut self.inherited);
        self.traversal.prepare(&mut cell.ctx, &self.full_name, inherited);
        self.input = cell.ctx.input.clone();
        tracing::debug!(
            "Entering {} composite '{}' ({} children)",
            self.slot.kind(),
            self.full_name,
            self.traversal.pipeline.children(self.id).len()
        );
        Ok(())
    }

    async fn do_run(&mut self) -> Result<Value, NodeError> {
        match self.slot.kind() {
            NodeKind::Sequential => self.run_chain().await?,
            NodeKind::Parallel => self.run_members().await?,
            NodeKind::Task => {
                return Err(NodeError::Configuration(format!(
                    "'{}' is not a composite",
                    self.full_name
                )))
            }
        }

        let output = Value::Object(self.outputs.clone());
        self.slot.cell().lock().await.ctx.output = output.clone();
        Ok(output)
    }

    async fn post_run(&mut self) -> Result<(), NodeError> {
        let mut cell = self.slot.cell().lock().await;
        cell.ctx
            .metadata
            .set("children.completed", self.outputs.len() as u64);
        Ok(())
    }
}
