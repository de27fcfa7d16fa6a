// crates/pipecore/tests/lifecycle_test.rs

use async_trait::async_trait;
use pipecore::{
    run_with_lifecycle, Completion, NodeContext, NodeError, Task, TaskConfig, TaskRun, Value,
};
use std::sync::{Arc, Mutex};

/// Records every hook call into a shared log
struct Recorder {
    log: Arc<Mutex<Vec<&'static str>>>,
    fail_in: Option<&'static str>,
}

impl Recorder {
    fn record(&self, phase: &'static str) -> Result<(), NodeError> {
        self.log.lock().unwrap().push(phase);
        if self.fail_in == Some(phase) {
            return Err(NodeError::ExecutionFailed(format!("{} failed", phase)));
        }
        Ok(())
    }
}

#[async_trait]
impl Task for Recorder {
    fn task_type(&self) -> &str {
        "test.recorder"
    }

    async fn pre_run(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
        self.record("pre")
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        self.record("run")?;
        Ok(Value::from(format!("ran {}", ctx.name)))
    }

    async fn post_run(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
        self.record("post")
    }
}

fn recorder(fail_in: Option<&'static str>) -> (Recorder, Arc<Mutex<Vec<&'static str>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (
        Recorder {
            log: Arc::clone(&log),
            fail_in,
        },
        log,
    )
}

#[tokio::test]
async fn test_hooks_run_in_order_and_mark_completion() {
    let (mut task, log) = recorder(None);
    let mut ctx = NodeContext::new("node", TaskConfig::default());
    let completion = Completion::new();

    let output = {
        let mut run = TaskRun::new(&mut task, &mut ctx, &completion);
        run_with_lifecycle(&mut run).await.unwrap()
    };

    assert_eq!(*log.lock().unwrap(), vec!["pre", "run", "post"]);
    assert_eq!(output, Value::from("ran node"));
    assert_eq!(ctx.output, output);
    assert!(completion.is_set());
}

#[tokio::test]
async fn test_failed_run_leaves_completion_unset() {
    let (mut task, log) = recorder(Some("run"));
    let mut ctx = NodeContext::new("node", TaskConfig::default());
    let completion = Completion::new();

    let result = {
        let mut run = TaskRun::new(&mut task, &mut ctx, &completion);
        run_with_lifecycle(&mut run).await
    };

    assert!(matches!(result, Err(NodeError::ExecutionFailed(_))));
    assert_eq!(*log.lock().unwrap(), vec!["pre", "run"]);
    assert!(!completion.is_set());
    assert!(ctx.output.is_null());
}

#[tokio::test]
async fn test_failed_post_run_leaves_completion_unset() {
    let (mut task, _log) = recorder(Some("post"));
    let mut ctx = NodeContext::new("node", TaskConfig::default());
    let completion = Completion::new();

    let mut run = TaskRun::new(&mut task, &mut ctx, &completion);
    assert!(run_with_lifecycle(&mut run).await.is_err());
    assert!(!completion.is_set());
}

#[tokio::test]
async fn test_timing_metadata_recorded() {
    let (mut task, _log) = recorder(None);
    let mut ctx = NodeContext::new("node", TaskConfig::default());
    let completion = Completion::new();

    {
        let mut run = TaskRun::new(&mut task, &mut ctx, &completion);
        run_with_lifecycle(&mut run).await.unwrap();
    }

    assert!(ctx.metadata.contains("run.start_utc"));
    assert!(ctx.metadata.contains("run.end_utc"));
    assert!(ctx.metadata.contains("run.duration_ms"));
}
