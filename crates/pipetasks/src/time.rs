use async_trait::async_trait;
use pipecore::{NodeContext, NodeError, Task, TaskConfig, Value};
use piperuntime::{TaskFactory, TaskMetadata};
use tokio::time::{sleep, Duration};

/// Delay execution for a configured duration
pub struct DelayTask {
    delay_ms: u64,
}

#[async_trait]
impl Task for DelayTask {
    fn task_type(&self) -> &str {
        "time.delay"
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        ctx.events.info(format!("Delaying for {}ms", self.delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(self.delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => {
                ctx.events.warn("Delay cancelled");
                return Err(NodeError::Cancelled);
            }
        }
        ctx.events.progress(100.0, Some("delay elapsed".to_string()));

        // Pass through the input
        Ok(ctx.input.clone())
    }
}

pub struct DelayTaskFactory;

impl TaskFactory for DelayTaskFactory {
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Task>, NodeError> {
        let delay_ms = config
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0);
        if delay_ms < 0.0 {
            return Err(NodeError::Configuration(format!(
                "delay_ms must not be negative, got {}",
                delay_ms
            )));
        }
        Ok(Box::new(DelayTask {
            delay_ms: delay_ms as u64,
        }))
    }

    fn task_type(&self) -> &str {
        "time.delay"
    }

    fn default_config(&self) -> TaskConfig {
        TaskConfig::new().with("delay_ms", 1000)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
