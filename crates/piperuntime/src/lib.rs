//! Pipeline execution runtime
//!
//! This crate provides the execution engine that walks composition trees,
//! the task registry, the structural views and the batch runner that fans a
//! single task type out over many targets.

mod batch;
mod executor;
pub mod graph;
mod registry;
mod runtime;

pub use batch::{
    BatchReport, BatchRunner, BatchState, InvocationResult, PersistConfig, Precall, PrecallContext,
    RunDescriptor, DEFAULT_TIMEOUT_SECS,
};
pub use executor::{ExecutionResult, PipelineExecutor};
pub use graph::{ascii_tree, edge_list, flatten, to_graph, Edge, EdgeKind, FlatEntry, GraphNode};
pub use registry::{TaskFactory, TaskMetadata, TaskRegistry};
pub use runtime::{CompletedRun, PipelineRuntime, RuntimeConfig};
