use crate::DataId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Composition misuse, raised while a pipeline is being built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("Invalid node name '{0}'")]
    InvalidName(String),

    #[error("Unknown node id {0}")]
    UnknownNode(usize),

    #[error("Node '{0}' is a task and cannot own children")]
    NotComposite(String),

    #[error("Node '{child}' is already linked under '{parent}'")]
    AlreadyOwned { child: String, parent: String },

    #[error("Composite '{composite}' already has a child named '{child}'")]
    DuplicateChild { composite: String, child: String },

    #[error("Linking '{child}' under '{parent}' would create a cycle")]
    Cycle { child: String, parent: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Unknown task type: {0}")]
    TaskType(String),

    #[error("Unknown composite: {0}")]
    Composite(String),

    #[error("Node not found: {0}")]
    Node(String),
}

/// Failure of a single node execution.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config does not match existing config '{name}'; configurations must be consistent within the same output store (override with clobber)")]
    ConfigMismatch { name: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unhandled failure: {0}")]
    Unexpected(String),

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Failed in task initialization: {0}")]
    Precall(NodeError),

    #[error("Failed on dataId={data_id}: {source}")]
    Invocation {
        data_id: DataId,
        #[source]
        source: NodeError,
    },

    #[error("Batch timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Failure reported by a data store or metadata sink.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Dataset '{dataset}' has no entry for dataId={data_id}")]
    Missing { dataset: String, data_id: DataId },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid store data: {0}")]
    Invalid(String),
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Storage(err.to_string())
    }
}
