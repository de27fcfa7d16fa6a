// crates/piperuntime/tests/graph_test.rs

use async_trait::async_trait;
use pipecore::{EventBus, NodeContext, NodeError, NodeId, NodeKind, Pipeline, Task, TaskConfig, Value};
use piperuntime::{ascii_tree, edge_list, flatten, to_graph, EdgeKind, GraphNode, PipelineExecutor};

struct Noop;

#[async_trait]
impl Task for Noop {
    fn task_type(&self) -> &str {
        "test.noop"
    }

    async fn run(&mut self, _ctx: &mut NodeContext) -> Result<Value, NodeError> {
        Ok(Value::Null)
    }
}

/// root(seq): first -> fan(par: x, y) -> last
fn sample() -> (Pipeline, NodeId) {
    let mut pipeline = Pipeline::new("sample");
    let root = pipeline.add_sequential("root").unwrap();
    let fan = pipeline.add_parallel("fan").unwrap();
    let mut task = |name: &str| {
        pipeline
            .add_task(name, Box::new(Noop), TaskConfig::default())
            .unwrap()
    };
    let first = task("first");
    let x = task("x");
    let y = task("y");
    let last = task("last");
    pipeline.link(fan, &[x, y]).unwrap();
    pipeline.link(root, &[first, fan, last]).unwrap();
    (pipeline, root)
}

fn task_node(name: &str) -> GraphNode {
    GraphNode::Task {
        name: name.to_string(),
    }
}

#[test]
fn test_flatten_is_depth_first_composite_first() {
    let (pipeline, root) = sample();

    let flat: Vec<(String, usize)> = flatten(&pipeline, root)
        .into_iter()
        .map(|e| (e.full_name, e.depth))
        .collect();

    assert_eq!(
        flat,
        vec![
            ("root".to_string(), 0),
            ("root.first".to_string(), 1),
            ("root.fan".to_string(), 1),
            ("root.fan.x".to_string(), 2),
            ("root.fan.y".to_string(), 2),
            ("root.last".to_string(), 1),
        ]
    );
}

#[test]
fn test_ascii_tree_marks_child_kinds() {
    let (pipeline, root) = sample();

    let tree = ascii_tree(&pipeline, root);
    let lines: Vec<&str> = tree.lines().collect();

    assert_eq!(lines[0], "root (sequential)");
    assert_eq!(lines[1], "   -> first [test.noop]");
    assert_eq!(lines[2], "   -> fan (parallel)");
    assert_eq!(lines[3], "      || x [test.noop]");
    assert_eq!(lines[5], "   -> last [test.noop]");
}

#[test]
fn test_edge_list_treats_composites_as_entries() {
    let (pipeline, root) = sample();
    let fan_entry = GraphNode::Entry {
        composite: "root.fan".to_string(),
        kind: NodeKind::Parallel,
    };

    let edges = edge_list(&pipeline, root);
    let successors: Vec<(String, String)> = edges
        .iter()
        .filter(|e| e.kind == EdgeKind::Successor)
        .map(|e| (e.from.to_string(), e.to.to_string()))
        .collect();

    assert_eq!(
        successors,
        vec![
            ("root.first".to_string(), "root.fan:entry".to_string()),
            ("root.fan:entry".to_string(), "root.last".to_string()),
        ]
    );
    assert!(edges
        .iter()
        .any(|e| e.kind == EdgeKind::Enters && e.from == fan_entry && e.to == task_node("root.fan.x")));
    assert!(!edges
        .iter()
        .any(|e| e.kind == EdgeKind::Successor && e.to == task_node("root.fan.y")));
}

#[test]
fn test_to_graph_counts() {
    let (pipeline, root) = sample();

    let graph = to_graph(&pipeline, root);

    assert_eq!(graph.node_count(), 6);
    assert_eq!(graph.edge_count(), edge_list(&pipeline, root).len());
}

#[tokio::test]
async fn test_views_are_pure_and_show_completion() {
    let (pipeline, root) = sample();

    let before = ascii_tree(&pipeline, root);
    assert_eq!(before, ascii_tree(&pipeline, root));
    assert_eq!(flatten(&pipeline, root), flatten(&pipeline, root));
    assert!(!before.contains('*'));

    PipelineExecutor::default()
        .execute(&pipeline, &EventBus::default(), Value::Null)
        .await
        .unwrap();

    let after = ascii_tree(&pipeline, root);
    assert_eq!(after, ascii_tree(&pipeline, root));
    assert!(after.lines().all(|line| line.ends_with(" *")));
}
