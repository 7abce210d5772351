use crate::{NodeStatus, FlowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted on every scheduler state transition. The streaming
/// invocation mode forwards each one as a newline-delimited line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    FlowStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeStatus {
        execution_id: ExecutionId,
        node_id: String,
        spec_id: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Partial token from a streaming ai-chat node.
    NodeToken {
        execution_id: ExecutionId,
        node_id: String,
        delta: String,
        timestamp: DateTime<Utc>,
    },
    NodeLog {
        execution_id: ExecutionId,
        node_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        execution_id: ExecutionId,
        status: FlowStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Event emitter handed to one node's execution
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: String,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            sender,
        }
    }

    /// Surface a partial token from a streaming provider call.
    pub fn token(&self, delta: impl Into<String>) {
        let _ = self.sender.send(ExecutionEvent::NodeToken {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            delta: delta.into(),
            timestamp: Utc::now(),
        });
    }

    /// Emit an informational message
    pub fn info(&self, message: impl Into<String>) {
        let _ = self.sender.send(ExecutionEvent::NodeLog {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

/// Broadcast bus carrying one run's events to all observers. Events are
/// dropped silently when no receiver is subscribed.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node_id: String) -> EventEmitter {
        EventEmitter::new(execution_id, node_id, self.sender.clone())
    }
}
