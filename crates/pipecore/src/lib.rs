//! Core abstractions for the pipeline engine
//!
//! This crate provides the node model, the lifecycle contract, the
//! composition tree and the collaborator traits that the runtime builds on.
//! It does not execute anything by itself.

mod config;
mod definition;
mod error;
pub mod events;
mod lifecycle;
mod metadata;
mod node;
mod pipeline;
mod store;
mod target;
mod value;

pub use config::TaskConfig;
pub use definition::{NodeSpec, PipelineDef, PipelineSettings};
pub use error::{BatchError, NodeError, NotFoundError, PipeError, StoreError, StructuralError};
pub use events::*;
pub use lifecycle::{run_with_lifecycle, Completion, Lifecycle, TaskRun};
pub use metadata::Metadata;
pub use node::{NodeContext, NodeKind, Task};
pub use pipeline::{Chain, ChainIter, DuplicatePolicy, NodeCell, NodeId, NodeSlot, Pipeline};
pub use store::{DataStore, MemoryStore, MetadataSink};
pub use target::{DataId, Target};
pub use value::Value;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipeError>;
