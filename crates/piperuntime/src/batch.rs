//! Fan-out of one task type over many independent targets.
//!
//! Every target gets a fresh task instance and its own context. Failures,
//! panics included, are contained per invocation; only raise-on-error or the
//! batch timeout can stop the siblings.

use crate::registry::{TaskFactory, TaskRegistry};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use pipecore::{
    run_with_lifecycle, BatchError, BatchId, Completion, DataId, DataStore, EventBus,
    ExecutionEvent, Metadata, MetadataSink, NodeContext, NodeError, Target, TaskConfig, TaskRun,
    Value,
};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// Batch timeout used when none (or zero) is given
pub const DEFAULT_TIMEOUT_SECS: u64 = 9999;

/// Everything needed to run one batch
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub task_type: String,
    /// Overrides merged on top of the factory defaults
    pub config: TaskConfig,
    pub raise_on_error: bool,
    /// 1 runs serially, more runs a pool of that size
    pub workers: usize,
    /// Applies to the whole pooled collection, not to each target
    pub timeout: Duration,
    pub return_results: bool,
    /// Overwrite persisted config and schemas instead of comparing
    pub clobber_config: bool,
    pub targets: Vec<Target>,
}

impl RunDescriptor {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            config: TaskConfig::default(),
            raise_on_error: false,
            workers: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            return_results: false,
            clobber_config: false,
            targets: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn with_target(mut self, target: impl Into<Target>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            timeout
        };
        self
    }

    pub fn raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = raise;
        self
    }

    pub fn return_results(mut self, keep: bool) -> Self {
        self.return_results = keep;
        self
    }

    pub fn clobber_config(mut self, clobber: bool) -> Self {
        self.clobber_config = clobber;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Precall,
    Dispatching { pooled: bool },
    Collecting,
    Done,
    Aborted,
    /// Precall failed without raise-on-error; nothing was dispatched
    Skipped,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Idle => f.write_str("idle"),
            BatchState::Precall => f.write_str("precall"),
            BatchState::Dispatching { pooled: true } => f.write_str("dispatching(pooled)"),
            BatchState::Dispatching { pooled: false } => f.write_str("dispatching(serial)"),
            BatchState::Collecting => f.write_str("collecting"),
            BatchState::Done => f.write_str("done"),
            BatchState::Aborted => f.write_str("aborted"),
            BatchState::Skipped => f.write_str("skipped"),
        }
    }
}

/// Outcome of one target, kept when the descriptor asks for results
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub index: usize,
    pub data_id: DataId,
    pub metadata: Metadata,
    /// `None` when the invocation failed
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub task_type: String,
    pub state: BatchState,
    /// Sorted by target index; empty unless results were requested
    pub results: Vec<InvocationResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl BatchReport {
    /// Return values in target order, `None` for failed targets
    pub fn values(&self) -> Vec<Option<&Value>> {
        self.results.iter().map(|r| r.result.as_ref()).collect()
    }
}

/// What a precall step gets to work with
pub struct PrecallContext<'a> {
    pub task_type: &'a str,
    pub factory: &'a dyn TaskFactory,
    /// Fully merged configuration every invocation will use
    pub config: &'a TaskConfig,
    pub clobber: bool,
    pub data: Option<&'a Arc<dyn DataStore>>,
}

/// One-time setup run before any target is dispatched.
#[async_trait]
pub trait Precall: Send + Sync {
    async fn precall(&self, ctx: &PrecallContext<'_>) -> Result<(), NodeError>;
}

/// Persist the task config and output schemas, or check them against what
/// an earlier batch stored.
///
/// Stored under `<task_type>_config` and `<dataset>_schema`. Without a data
/// store there is nothing to check.
#[derive(Debug, Default, Clone, Copy)]
pub struct PersistConfig;

#[async_trait]
impl Precall for PersistConfig {
    async fn precall(&self, ctx: &PrecallContext<'_>) -> Result<(), NodeError> {
        let Some(store) = ctx.data else {
            tracing::debug!("No data store attached; not persisting config for {}", ctx.task_type);
            return Ok(());
        };

        let task = ctx.factory.create(ctx.config)?;

        let config_name = format!("{}_config", ctx.task_type);
        match store.get_config(&config_name).await? {
            Some(persisted) if !ctx.clobber => {
                let differences = ctx.config.diff(&persisted);
                if !differences.is_empty() {
                    for line in &differences {
                        tracing::error!("Comparing configuration: {}", line);
                    }
                    return Err(NodeError::ConfigMismatch { name: config_name });
                }
            }
            _ => store.put_config(&config_name, ctx.config).await?,
        }

        for (dataset, schema) in task.schemas() {
            let schema_name = format!("{}_schema", dataset);
            match store.get(&schema_name, &DataId::empty()).await? {
                Some(existing) if !ctx.clobber => {
                    if existing != schema {
                        tracing::error!(
                            "Comparing schema {}: stored {:?}, current {:?}",
                            schema_name,
                            existing,
                            schema
                        );
                        return Err(NodeError::ConfigMismatch { name: schema_name });
                    }
                }
                _ => store.put(&schema_name, &DataId::empty(), schema).await?,
            }
        }

        Ok(())
    }
}

/// Runs batches against a task registry
pub struct BatchRunner {
    registry: Arc<TaskRegistry>,
    data: Option<Arc<dyn DataStore>>,
    sink: Option<Arc<dyn MetadataSink>>,
    events: Arc<EventBus>,
    precall: Arc<dyn Precall>,
}

impl BatchRunner {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            data: None,
            sink: None,
            events: Arc::new(EventBus::default()),
            precall: Arc::new(PersistConfig),
        }
    }

    pub fn with_data_store(mut self, data: Arc<dyn DataStore>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_precall(mut self, precall: Arc<dyn Precall>) -> Self {
        self.precall = precall;
        self
    }

    /// Run `desc` to completion.
    ///
    /// Unknown task types, raise-on-error failures and the pooled timeout
    /// are returned as errors. Everything else ends in a report.
    pub async fn run(&self, desc: RunDescriptor) -> Result<BatchReport, BatchError> {
        let batch_id = BatchId::new_v4();
        let start = Instant::now();
        let mut state = BatchState::Idle;

        let factory = self.registry.factory(&desc.task_type)?;
        let config = self.registry.resolve_config(&desc.task_type, &desc.config)?;

        advance(&mut state, BatchState::Precall, &desc.task_type);
        let precall_ctx = PrecallContext {
            task_type: &desc.task_type,
            factory: factory.as_ref(),
            config: &config,
            clobber: desc.clobber_config,
            data: self.data.as_ref(),
        };
        if let Err(error) = self.precall.precall(&precall_ctx).await {
            if desc.raise_on_error {
                advance(&mut state, BatchState::Aborted, &desc.task_type);
                self.emit_finished(batch_id, state, 0, 0);
                return Err(BatchError::Precall(error));
            }
            tracing::error!("Failed in task initialization: {}", error);
            advance(&mut state, BatchState::Skipped, &desc.task_type);
            return Ok(self.report(batch_id, &desc.task_type, state, Collector::empty(), start));
        }

        if desc.targets.is_empty() {
            tracing::warn!("Not running the task because there is no data to process.");
            advance(&mut state, BatchState::Done, &desc.task_type);
            return Ok(self.report(batch_id, &desc.task_type, state, Collector::empty(), start));
        }

        let pooled = if desc.workers > 1 && !factory.supports_pool() {
            tracing::warn!(
                "Task {} cannot run in a pool; running {} targets serially",
                desc.task_type,
                desc.targets.len()
            );
            false
        } else {
            desc.workers > 1
        };

        self.events.emit(ExecutionEvent::BatchStarted {
            batch_id,
            task_type: desc.task_type.clone(),
            targets: desc.targets.len(),
            workers: if pooled { desc.workers } else { 1 },
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Running {} on {} targets with {} worker(s)",
            desc.task_type,
            desc.targets.len(),
            if pooled { desc.workers } else { 1 }
        );

        advance(&mut state, BatchState::Dispatching { pooled }, &desc.task_type);
        let dispatch = Dispatch {
            batch_id,
            task_type: desc.task_type.clone(),
            factory,
            config,
            data: self.data.clone(),
            sink: self.sink.clone(),
            events: Arc::clone(&self.events),
            cancellation: CancellationToken::new(),
        };
        let mut collector = Collector::new(&desc, batch_id, Arc::clone(&self.events));
        let targets = desc.targets;

        let dispatched = if pooled {
            dispatch_pooled(&dispatch, targets, desc.workers, desc.timeout, &mut collector).await
        } else {
            dispatch_serial(&dispatch, targets, &mut collector).await
        };
        if let Err(error) = dispatched {
            tracing::error!("Batch {} aborted: {}", desc.task_type, error);
            advance(&mut state, BatchState::Aborted, &desc.task_type);
            self.emit_finished(batch_id, state, collector.succeeded, collector.failed);
            return Err(error);
        }

        advance(&mut state, BatchState::Collecting, &desc.task_type);
        collector.close();
        advance(&mut state, BatchState::Done, &desc.task_type);
        Ok(self.report(batch_id, &desc.task_type, state, collector, start))
    }

    fn report(
        &self,
        batch_id: BatchId,
        task_type: &str,
        state: BatchState,
        collector: Collector,
        start: Instant,
    ) -> BatchReport {
        self.emit_finished(batch_id, state, collector.succeeded, collector.failed);
        BatchReport {
            batch_id,
            task_type: task_type.to_string(),
            state,
            results: collector.results,
            succeeded: collector.succeeded,
            failed: collector.failed,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn emit_finished(&self, batch_id: BatchId, state: BatchState, succeeded: usize, failed: usize) {
        self.events.emit(ExecutionEvent::BatchFinished {
            batch_id,
            state: state.to_string(),
            succeeded,
            failed,
            timestamp: Utc::now(),
        });
    }
}

fn advance(state: &mut BatchState, next: BatchState, task_type: &str) {
    tracing::debug!("Batch {}: {} -> {}", task_type, state, next);
    *state = next;
}

async fn dispatch_serial(
    dispatch: &Dispatch,
    targets: Vec<Target>,
    collector: &mut Collector,
) -> Result<(), BatchError> {
    for (index, target) in targets.into_iter().enumerate() {
        let data_id = target.data_id.clone();
        let outcome = AssertUnwindSafe(dispatch.clone().invoke(index, target))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Outcome::lost(index, data_id, panic_message(panic.as_ref())));
        collector.accept(outcome)?;
    }
    Ok(())
}

async fn dispatch_pooled(
    dispatch: &Dispatch,
    targets: Vec<Target>,
    workers: usize,
    timeout: Duration,
    collector: &mut Collector,
) -> Result<(), BatchError> {
    let handle = Handle::current();
    let mut jobs = JoinSet::new();
    // Targets currently held by a worker, keyed by its task id
    let mut in_flight: HashMap<task::Id, (usize, DataId)> = HashMap::with_capacity(workers);
    let mut queue = targets.into_iter().enumerate();

    let collect = async {
        loop {
            while jobs.len() < workers {
                let Some((index, target)) = queue.next() else {
                    break;
                };
                let data_id = target.data_id.clone();
                let job = dispatch.clone();
                let handle = handle.clone();
                // Each invocation owns a blocking thread so a run that never
                // yields cannot stall the timeout below.
                let worker = jobs.spawn_blocking(move || handle.block_on(job.invoke(index, target)));
                in_flight.insert(worker.id(), (index, data_id));
            }

            let Some(joined) = jobs.join_next_with_id().await else {
                return Ok::<(), BatchError>(());
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    outcome
                }
                Err(error) => {
                    let Some((index, data_id)) = in_flight.remove(&error.id()) else {
                        tracing::error!("Worker {} lost with no target on record: {}", error.id(), error);
                        continue;
                    };
                    let reason = if error.is_panic() {
                        panic_message(error.into_panic().as_ref())
                    } else {
                        error.to_string()
                    };
                    Outcome::lost(index, data_id, reason)
                }
            };
            collector.accept(outcome)?;
        }
    };

    let result = match tokio::time::timeout(timeout, collect).await {
        Ok(result) => result,
        Err(_) => Err(BatchError::Timeout { timeout }),
    };

    if result.is_err() {
        // Cooperative runs stop at their next await; blocked threads are
        // abandoned and their outcomes dropped with the join set.
        dispatch.cancellation.cancel();
        jobs.abort_all();
    }
    result
}

/// Finished invocation, as seen by the collector
struct Outcome {
    index: usize,
    data_id: DataId,
    metadata: Metadata,
    result: Result<Value, NodeError>,
}

impl Outcome {
    /// A worker that died without reporting back, e.g. a panic outside the task.
    fn lost(index: usize, data_id: DataId, reason: String) -> Self {
        tracing::error!("Worker for dataId={} lost: {}", data_id, reason);
        Self {
            index,
            data_id,
            metadata: Metadata::new(),
            result: Err(NodeError::Unexpected(reason)),
        }
    }
}

/// Everything a worker needs, cheap to clone per target
#[derive(Clone)]
struct Dispatch {
    batch_id: BatchId,
    task_type: String,
    factory: Arc<dyn TaskFactory>,
    config: TaskConfig,
    data: Option<Arc<dyn DataStore>>,
    sink: Option<Arc<dyn MetadataSink>>,
    events: Arc<EventBus>,
    cancellation: CancellationToken,
}

impl Dispatch {
    async fn invoke(self, index: usize, target: Target) -> Outcome {
        let data_id = target.data_id.clone();
        let name = self.task_type.replace('.', "_");

        let mut ctx = NodeContext::new(name.clone(), self.config.clone());
        ctx.events = self
            .events
            .create_emitter(self.batch_id, format!("{} {}", name, data_id));
        ctx.target = Some(target);
        ctx.data = self.data.clone();
        ctx.cancellation = self.cancellation.child_token();
        let cancelled = ctx.cancellation.clone();

        let result = tokio::select! {
            caught = AssertUnwindSafe(self.run_fresh(&mut ctx)).catch_unwind() => {
                caught.unwrap_or_else(|panic| Err(NodeError::Unexpected(panic_message(panic.as_ref()))))
            }
            _ = cancelled.cancelled() => Err(NodeError::Cancelled),
        };

        if let Some(sink) = &self.sink {
            let metadata_name = format!("{}_metadata", self.task_type);
            if let Err(error) = sink.write(&metadata_name, &data_id, &ctx.metadata).await {
                tracing::warn!("Could not persist metadata for dataId={}: {}", data_id, error);
            }
        }

        Outcome {
            index,
            data_id,
            metadata: ctx.metadata,
            result,
        }
    }

    async fn run_fresh(&self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let mut task = self.factory.create(&self.config)?;
        let completion = Completion::new();
        let mut run = TaskRun::new(task.as_mut(), ctx, &completion);
        run_with_lifecycle(&mut run).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

struct Collector {
    batch_id: BatchId,
    events: Option<Arc<EventBus>>,
    raise_on_error: bool,
    return_results: bool,
    results: Vec<InvocationResult>,
    succeeded: usize,
    failed: usize,
}

impl Collector {
    fn new(desc: &RunDescriptor, batch_id: BatchId, events: Arc<EventBus>) -> Self {
        Self {
            batch_id,
            events: Some(events),
            raise_on_error: desc.raise_on_error,
            return_results: desc.return_results,
            results: Vec::new(),
            succeeded: 0,
            failed: 0,
        }
    }

    fn empty() -> Self {
        Self {
            batch_id: BatchId::nil(),
            events: None,
            raise_on_error: false,
            return_results: false,
            results: Vec::new(),
            succeeded: 0,
            failed: 0,
        }
    }

    fn accept(&mut self, outcome: Outcome) -> Result<(), BatchError> {
        match outcome.result {
            Ok(value) => {
                self.succeeded += 1;
                if self.return_results {
                    self.results.push(InvocationResult {
                        index: outcome.index,
                        data_id: outcome.data_id,
                        metadata: outcome.metadata,
                        result: Some(value),
                        error: None,
                    });
                }
            }
            Err(error) => {
                self.failed += 1;
                self.emit_failed(&outcome.data_id, &error.to_string());
                if self.raise_on_error {
                    return Err(BatchError::Invocation {
                        data_id: outcome.data_id,
                        source: error,
                    });
                }
                tracing::error!("Failed on dataId={}: {}", outcome.data_id, error);
                if self.return_results {
                    self.results.push(InvocationResult {
                        index: outcome.index,
                        data_id: outcome.data_id,
                        metadata: outcome.metadata,
                        result: None,
                        error: Some(error.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Put results back in target order.
    fn close(&mut self) {
        self.results.sort_by_key(|r| r.index);
    }

    fn emit_failed(&self, data_id: &DataId, error: &str) {
        if let Some(events) = &self.events {
            events.emit(ExecutionEvent::InvocationFailed {
                batch_id: self.batch_id,
                data_id: data_id.to_string(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}
