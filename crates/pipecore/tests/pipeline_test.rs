// crates/pipecore/tests/pipeline_test.rs

use async_trait::async_trait;
use pipecore::{
    DuplicatePolicy, NodeContext, NodeError, NodeKind, Pipeline, StructuralError, Task,
    TaskConfig, Value,
};

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

fn task(pipeline: &mut Pipeline, name: &str) -> pipecore::NodeId {
    pipeline
        .add_task(name, Box::new(Noop), TaskConfig::default())
        .expect("valid task name")
}

#[test]
fn test_sequential_link_builds_chain() {
    let mut pipeline = Pipeline::new("p");
    let seq = pipeline.add_sequential("seq").unwrap();
    let a = task(&mut pipeline, "a");
    let b = task(&mut pipeline, "b");
    let c = task(&mut pipeline, "c");

    assert_eq!(pipeline.link(seq, &[a]).unwrap(), 1);
    assert_eq!(pipeline.head(seq), Some(a));
    assert_eq!(pipeline.tail(seq), Some(a));

    assert_eq!(pipeline.link(seq, &[b, c]).unwrap(), 2);
    assert_eq!(pipeline.head(seq), Some(a));
    assert_eq!(pipeline.tail(seq), Some(c));
    assert_eq!(pipeline.successor(a), Some(b));
    assert_eq!(pipeline.successor(b), Some(c));
    assert_eq!(pipeline.successor(c), None);
    assert_eq!(pipeline.children(seq), vec![a, b, c]);
}

#[test]
fn test_parallel_link_has_no_chain() {
    let mut pipeline = Pipeline::new("p");
    let par = pipeline.add_parallel("par").unwrap();
    let a = task(&mut pipeline, "a");
    let b = task(&mut pipeline, "b");

    pipeline.link(par, &[a, b]).unwrap();

    assert_eq!(pipeline.children(par), vec![a, b]);
    assert_eq!(pipeline.head(par), None);
    assert_eq!(pipeline.successor(a), None);
    assert_eq!(pipeline.node(par).unwrap().kind(), NodeKind::Parallel);
}

#[test]
fn test_duplicate_name_skipped_by_default() {
    let mut pipeline = Pipeline::new("p");
    let seq = pipeline.add_sequential("seq").unwrap();
    let a = task(&mut pipeline, "a");
    let other_a = task(&mut pipeline, "a");

    pipeline.link(seq, &[a]).unwrap();
    assert_eq!(pipeline.link(seq, &[other_a]).unwrap(), 0);
    // relinking the same node is a no-op as well
    assert_eq!(pipeline.link(seq, &[a]).unwrap(), 0);

    assert_eq!(pipeline.children(seq), vec![a]);
    assert_eq!(pipeline.node(other_a).unwrap().parent(), None);
}

#[test]
fn test_skipped_duplicate_is_never_the_implicit_root() {
    let mut pipeline = Pipeline::new("p");
    // created before the real root, then dropped as a duplicate
    let stray = pipeline.add_parallel("inner").unwrap();
    let root = pipeline.add_sequential("root").unwrap();
    let inner = pipeline.add_sequential("inner").unwrap();

    pipeline.link(root, &[inner]).unwrap();
    assert_eq!(pipeline.link(root, &[stray]).unwrap(), 0);

    assert_eq!(pipeline.node(stray).unwrap().parent(), None);
    assert_eq!(pipeline.root(), Some(root));
}

#[test]
fn test_duplicate_name_rejected_under_reject_policy() {
    let mut pipeline = Pipeline::new("p").with_duplicate_policy(DuplicatePolicy::Reject);
    let seq = pipeline.add_sequential("seq").unwrap();
    let a = task(&mut pipeline, "a");
    let other_a = task(&mut pipeline, "a");
    let b = task(&mut pipeline, "b");

    pipeline.link(seq, &[a]).unwrap();
    let err = pipeline.link(seq, &[b, other_a]).unwrap_err();

    assert!(matches!(err, StructuralError::DuplicateChild { ref child, .. } if child == "a"));
    // the whole call was rejected, including b
    assert_eq!(pipeline.children(seq), vec![a]);
    assert_eq!(pipeline.node(b).unwrap().parent(), None);
}

#[test]
fn test_node_cannot_have_two_parents() {
    let mut pipeline = Pipeline::new("p");
    let first = pipeline.add_sequential("first").unwrap();
    let second = pipeline.add_parallel("second").unwrap();
    let a = task(&mut pipeline, "a");

    pipeline.link(first, &[a]).unwrap();
    let err = pipeline.link(second, &[a]).unwrap_err();

    assert_eq!(
        err,
        StructuralError::AlreadyOwned {
            child: "a".to_string(),
            parent: "first".to_string(),
        }
    );
    assert!(pipeline.children(second).is_empty());
}

#[test]
fn test_cycles_are_rejected() {
    let mut pipeline = Pipeline::new("p");
    let outer = pipeline.add_sequential("outer").unwrap();
    let inner = pipeline.add_parallel("inner").unwrap();

    pipeline.link(outer, &[inner]).unwrap();

    assert!(matches!(
        pipeline.link(inner, &[outer]),
        Err(StructuralError::Cycle { .. })
    ));
    assert!(matches!(
        pipeline.link(inner, &[inner]),
        Err(StructuralError::Cycle { .. })
    ));
}

#[test]
fn test_link_under_task_fails() {
    let mut pipeline = Pipeline::new("p");
    let a = task(&mut pipeline, "a");
    let b = task(&mut pipeline, "b");

    assert_eq!(
        pipeline.link(a, &[b]),
        Err(StructuralError::NotComposite("a".to_string()))
    );
}

#[test]
fn test_names_are_normalized_and_validated() {
    let mut pipeline = Pipeline::new("p");
    let id = task(&mut pipeline, "my task");
    assert_eq!(pipeline.node(id).unwrap().name(), "my_task");

    assert!(matches!(
        pipeline.add_task("a.b", Box::new(Noop), TaskConfig::default()),
        Err(StructuralError::InvalidName(_))
    ));
    assert!(matches!(
        pipeline.add_sequential("   "),
        Err(StructuralError::InvalidName(_))
    ));
}

#[test]
fn test_full_names_and_lookup() {
    let mut pipeline = Pipeline::new("p");
    let root = pipeline.add_sequential("all_stats").unwrap();
    let par = pipeline.add_parallel("fanout").unwrap();
    let mean = task(&mut pipeline, "mean");

    pipeline.link(par, &[mean]).unwrap();
    pipeline.link(root, &[par]).unwrap();

    assert_eq!(pipeline.full_name(mean), "all_stats.fanout.mean");
    assert_eq!(pipeline.find("all_stats.fanout.mean"), Some(mean));
    assert_eq!(pipeline.find("fanout.mean"), None);
    assert_eq!(pipeline.root(), Some(root));
    assert!(pipeline.is_ancestor(root, mean));
    assert!(!pipeline.is_ancestor(mean, root));
}
