use crate::NodeKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;
pub type BatchId = Uuid;

/// Events emitted while pipelines and batches run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: ExecutionId,
        pipeline: String,
        timestamp: DateTime<Utc>,
    },
    PipelineCompleted {
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node: String,
        kind: NodeKind,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node: String,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
    BatchStarted {
        batch_id: BatchId,
        task_type: String,
        targets: usize,
        workers: usize,
        timestamp: DateTime<Utc>,
    },
    InvocationFailed {
        batch_id: BatchId,
        data_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    BatchFinished {
        batch_id: BatchId,
        state: String,
        succeeded: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to a running node.
///
/// Every message is also forwarded to `tracing` so nodes need only one
/// reporting channel.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node: node.into(),
            sender,
        }
    }

    /// An emitter nobody listens to; used for nodes that have not run yet.
    pub fn detached(node: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(ExecutionId::nil(), node, sender)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id,
            node: self.node.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(node = %self.node, "{}", message);
        self.emit(NodeEvent::Info { message });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(node = %self.node, "{}", message);
        self.emit(NodeEvent::Warning { message });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        tracing::debug!(node = %self.node, percent, "progress");
        self.emit(NodeEvent::Progress { percent, message });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node: impl Into<String>) -> EventEmitter {
        EventEmitter::new(execution_id, node, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
