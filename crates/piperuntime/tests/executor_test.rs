// crates/piperuntime/tests/executor_test.rs

use async_trait::async_trait;
use pipecore::{
    EventBus, ExecutionEvent, NodeContext, NodeError, NodeId, PipeError, Pipeline, Task,
    TaskConfig, Value,
};
use piperuntime::PipelineExecutor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Appends its name to a shared log when run
struct Step {
    log: Arc<Mutex<Vec<String>>>,
    delay_ms: u64,
    fail: bool,
}

#[async_trait]
impl Task for Step {
    fn task_type(&self) -> &str {
        "test.step"
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.log.lock().unwrap().push(ctx.name.clone());
        if self.fail {
            return Err(NodeError::ExecutionFailed(format!("{} failed", ctx.name)));
        }
        Ok(ctx.input.clone())
    }
}

/// Tracks how many instances are inside `run` at once
struct Gauge {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Task for Gauge {
    fn task_type(&self) -> &str {
        "test.gauge"
    }

    async fn run(&mut self, _ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

struct Fixture {
    pipeline: Pipeline,
    log: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            pipeline: Pipeline::new("test"),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn step(&mut self, name: &str) -> NodeId {
        self.step_with(name, 0, false)
    }

    fn step_with(&mut self, name: &str, delay_ms: u64, fail: bool) -> NodeId {
        let task = Step {
            log: Arc::clone(&self.log),
            delay_ms,
            fail,
        };
        self.pipeline
            .add_task(name, Box::new(task), TaskConfig::default())
            .unwrap()
    }

    fn ran(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_sequential_runs_in_chain_order() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let a = fx.step_with("a", 20, false);
    let b = fx.step("b");
    let c = fx.step("c");
    fx.pipeline.link(root, &[a, b, c]).unwrap();

    let bus = EventBus::default();
    let result = PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::Null)
        .await
        .unwrap();

    assert_eq!(fx.ran(), vec!["a", "b", "c"]);
    assert_eq!(result.completed_nodes, 4);
    assert_eq!(result.total_nodes, 4);
    for id in [root, a, b, c] {
        assert!(fx.pipeline.is_completed(id));
    }
}

#[tokio::test]
async fn test_rerun_executes_nothing() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let a = fx.step("a");
    let b = fx.step("b");
    fx.pipeline.link(root, &[a, b]).unwrap();

    let bus = EventBus::default();
    let executor = PipelineExecutor::default();
    executor.execute(&fx.pipeline, &bus, Value::Null).await.unwrap();
    executor.execute(&fx.pipeline, &bus, Value::Null).await.unwrap();
    assert_eq!(fx.ran(), vec!["a", "b"]);

    fx.pipeline.reset();
    assert!(!fx.pipeline.is_completed(root));
    executor.execute(&fx.pipeline, &bus, Value::Null).await.unwrap();
    assert_eq!(fx.ran(), vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_parallel_runs_every_child() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_parallel("root").unwrap();
    let a = fx.step_with("a", 30, false);
    let b = fx.step_with("b", 10, false);
    let c = fx.step("c");
    fx.pipeline.link(root, &[a, b, c]).unwrap();

    let bus = EventBus::default();
    let result = PipelineExecutor::new(2)
        .execute(&fx.pipeline, &bus, Value::Null)
        .await
        .unwrap();

    let mut ran = fx.ran();
    ran.sort();
    assert_eq!(ran, vec!["a", "b", "c"]);
    for id in [root, a, b, c] {
        assert!(fx.pipeline.is_completed(id));
    }

    let output = result.output.as_object().unwrap();
    assert_eq!(output.len(), 3);
    assert!(output.contains_key("a"));
}

#[tokio::test]
async fn test_parallel_children_overlap_up_to_the_limit() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new("test");
    let root = pipeline.add_parallel("root").unwrap();
    let children: Vec<NodeId> = (0..5)
        .map(|i| {
            let gauge = Gauge {
                in_flight: Arc::clone(&in_flight),
                peak: Arc::clone(&peak),
            };
            pipeline
                .add_task(&format!("g{}", i), Box::new(gauge), TaskConfig::default())
                .unwrap()
        })
        .collect();
    pipeline.link(root, &children).unwrap();

    let bus = EventBus::default();
    let result = PipelineExecutor::new(2)
        .execute(&pipeline, &bus, Value::Null)
        .await
        .unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(result.completed_nodes, 6);
}

#[tokio::test]
async fn test_nested_composites_recurse() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let fan = fx.pipeline.add_parallel("fan").unwrap();
    let first = fx.step("first");
    let x = fx.step("x");
    let y = fx.step("y");
    let last = fx.step("last");
    fx.pipeline.link(fan, &[x, y]).unwrap();
    fx.pipeline.link(root, &[first, fan, last]).unwrap();

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::Null)
        .await
        .unwrap();

    let ran = fx.ran();
    assert_eq!(ran.first().map(String::as_str), Some("first"));
    assert_eq!(ran.last().map(String::as_str), Some("last"));
    assert_eq!(ran.len(), 4);
    assert!(fx.pipeline.is_completed(fan));

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeCompleted { node, .. } = event {
            completed.push(node);
        }
    }
    let position = |name: &str| completed.iter().position(|n| n == name).unwrap();
    assert!(position("root.fan.x") < position("root.fan"));
    assert!(position("root.fan.y") < position("root.fan"));
    assert!(position("root.fan") < position("root.last"));
    assert!(position("root.last") < position("root"));
    assert_eq!(completed.last().map(String::as_str), Some("root"));
}

#[tokio::test]
async fn test_input_is_inherited_and_outputs_collected() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let a = fx.step("a");
    let b = fx.step("b");
    fx.pipeline.link(root, &[a, b]).unwrap();
    fx.pipeline.set_input(b, Value::from("own input")).unwrap();

    let bus = EventBus::default();
    let result = PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::from("shared"))
        .await
        .unwrap();

    assert_eq!(fx.pipeline.output(a).await.unwrap(), Value::from("shared"));
    assert_eq!(fx.pipeline.output(b).await.unwrap(), Value::from("own input"));
    assert_eq!(result.output.get("a"), Some(&Value::from("shared")));
    assert_eq!(fx.pipeline.output(root).await.unwrap(), result.output);
}

#[tokio::test]
async fn test_failure_stops_chain_and_leaves_ancestors_incomplete() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let a = fx.step("a");
    let b = fx.step_with("b", 0, true);
    let c = fx.step("c");
    fx.pipeline.link(root, &[a, b, c]).unwrap();

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let err = PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::Null)
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::Node(NodeError::ExecutionFailed(_))));
    assert_eq!(fx.ran(), vec!["a", "b"]);
    assert!(fx.pipeline.is_completed(a));
    assert!(!fx.pipeline.is_completed(b));
    assert!(!fx.pipeline.is_completed(c));
    assert!(!fx.pipeline.is_completed(root));

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeFailed { node, .. } = event {
            failed.push(node);
        }
    }
    assert_eq!(failed, vec!["root.b", "root"]);
}

#[tokio::test]
async fn test_single_task_root() {
    let mut fx = Fixture::new();
    let only = fx.step("only");

    let bus = EventBus::default();
    let result = PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::from(1.0))
        .await
        .unwrap();

    assert_eq!(fx.ran(), vec!["only"]);
    assert_eq!(result.output, Value::from(1.0));
    assert!(fx.pipeline.is_completed(only));
}

#[tokio::test]
async fn test_full_metadata_uses_dotted_prefixes() {
    let mut fx = Fixture::new();
    let root = fx.pipeline.add_sequential("root").unwrap();
    let a = fx.step("a");
    fx.pipeline.link(root, &[a]).unwrap();

    let bus = EventBus::default();
    PipelineExecutor::default()
        .execute(&fx.pipeline, &bus, Value::Null)
        .await
        .unwrap();

    let metadata = fx.pipeline.full_metadata().await;
    assert!(metadata.contains("root:a.run.duration_ms"));
    assert!(metadata.contains("root.children.completed"));
}
