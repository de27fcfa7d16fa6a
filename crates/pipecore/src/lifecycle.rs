use crate::{NodeContext, NodeError, Task, Value};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Completion marker of one node. Only [`run_with_lifecycle`] sets it.
#[derive(Debug, Default)]
pub struct Completion(AtomicBool);

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag before a new run. Needs exclusive access so a flag can
    /// never be cleared while its node is executing.
    pub fn reset(&mut self) {
        *self.0.get_mut() = false;
    }
}

/// The three-phase contract shared by every executable node kind.
#[async_trait]
pub trait Lifecycle: Send {
    fn completion(&self) -> &Completion;

    async fn pre_run(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn do_run(&mut self) -> Result<Value, NodeError>;

    async fn post_run(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Run `node` as `pre_run; do_run; post_run` and mark it complete.
///
/// If any phase fails the error is returned and completion is left unset.
pub async fn run_with_lifecycle<N>(node: &mut N) -> Result<Value, NodeError>
where
    N: Lifecycle + ?Sized,
{
    node.pre_run().await?;
    let result = node.do_run().await?;
    node.post_run().await?;
    node.completion().mark();
    Ok(result)
}

/// Lifecycle binding of a [`Task`] to its context.
pub struct TaskRun<'a> {
    task: &'a mut dyn Task,
    ctx: &'a mut NodeContext,
    completion: &'a Completion,
}

impl<'a> TaskRun<'a> {
    pub fn new(task: &'a mut dyn Task, ctx: &'a mut NodeContext, completion: &'a Completion) -> Self {
        Self {
            task,
            ctx,
            completion,
        }
    }
}

#[async_trait]
impl Lifecycle for TaskRun<'_> {
    fn completion(&self) -> &Completion {
        self.completion
    }

    async fn pre_run(&mut self) -> Result<(), NodeError> {
        self.task.pre_run(self.ctx).await
    }

    async fn do_run(&mut self) -> Result<Value, NodeError> {
        let start = Instant::now();
        self.ctx.metadata.set("run.start_utc", Utc::now().to_rfc3339());
        let result = self.task.run(self.ctx).await;
        self.ctx.metadata.set("run.end_utc", Utc::now().to_rfc3339());
        self.ctx
            .metadata
            .set("run.duration_ms", start.elapsed().as_millis() as u64);

        let output = result?;
        self.ctx.output = output.clone();
        Ok(output)
    }

    async fn post_run(&mut self) -> Result<(), NodeError> {
        self.task.post_run(self.ctx).await
    }
}
