use async_trait::async_trait;
use pipecore::{NodeContext, NodeError, Task, TaskConfig, Value};
use piperuntime::{TaskFactory, TaskMetadata};

/// Simple debug task that logs its input and target, then passes the input on
pub struct DebugTask;

#[async_trait]
impl Task for DebugTask {
    fn task_type(&self) -> &str {
        "debug.log"
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let message = ctx
            .config
            .get_str("message")
            .map(str::to_string)
            .or_else(|| ctx.input.get("message").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| "(no message)".to_string());

        ctx.events.info(format!("DEBUG {}: {}", ctx.full_name, message));
        ctx.events.info(format!("  input: {:?}", ctx.input));
        if let Some(data_id) = ctx.data_id() {
            ctx.events.info(format!("  dataId: {}", data_id));
        }

        ctx.metadata.set("message", message);
        Ok(ctx.input.clone())
    }
}

pub struct DebugTaskFactory;

impl TaskFactory for DebugTaskFactory {
    fn create(&self, _config: &TaskConfig) -> Result<Box<dyn Task>, NodeError> {
        Ok(Box::new(DebugTask))
    }

    fn task_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
