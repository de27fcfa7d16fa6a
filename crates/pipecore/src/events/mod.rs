// crates/pipecore/src/events/mod.rs

mod base;

pub use base::{BatchId, EventBus, EventEmitter, ExecutionEvent, ExecutionId, NodeEvent};
