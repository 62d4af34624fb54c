use crate::{Digest, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    EvaluationStarted {
        execution_id: ExecutionId,
        root: Digest,
        nodes: usize,
        timestamp: DateTime<Utc>,
    },
    EvaluationCompleted {
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeDispatched {
        execution_id: ExecutionId,
        node_id: NodeId,
        digest: Digest,
        op: String,
        executor: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeRetrying {
        execution_id: ExecutionId,
        node_id: NodeId,
        digest: Digest,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeCacheHit {
        execution_id: ExecutionId,
        node_id: NodeId,
        digest: Digest,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        digest: Digest,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        digest: Digest,
        error: String,
        timestamp: DateTime<Utc>,
    },
    GraphSpliced {
        execution_id: ExecutionId,
        node_id: NodeId,
        added: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Emitter bound to one evaluation run
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn dispatched(&self, node_id: NodeId, digest: Digest, op: &str, executor: &str, attempt: u32) {
        self.emit(ExecutionEvent::NodeDispatched {
            execution_id: self.execution_id,
            node_id,
            digest,
            op: op.to_string(),
            executor: executor.to_string(),
            attempt,
            timestamp: Utc::now(),
        });
    }

    pub fn retrying(&self, node_id: NodeId, digest: Digest, attempt: u32, delay_ms: u64, error: String) {
        self.emit(ExecutionEvent::NodeRetrying {
            execution_id: self.execution_id,
            node_id,
            digest,
            attempt,
            delay_ms,
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn cache_hit(&self, node_id: NodeId, digest: Digest) {
        self.emit(ExecutionEvent::NodeCacheHit {
            execution_id: self.execution_id,
            node_id,
            digest,
            timestamp: Utc::now(),
        });
    }

    pub fn completed(&self, node_id: NodeId, digest: Digest, duration_ms: u64) {
        self.emit(ExecutionEvent::NodeCompleted {
            execution_id: self.execution_id,
            node_id,
            digest,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn failed(&self, node_id: NodeId, digest: Digest, error: String) {
        self.emit(ExecutionEvent::NodeFailed {
            execution_id: self.execution_id,
            node_id,
            digest,
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn spliced(&self, node_id: NodeId, added: usize) {
        self.emit(ExecutionEvent::GraphSpliced {
            execution_id: self.execution_id,
            node_id,
            added,
            timestamp: Utc::now(),
        });
    }
}

/// Global event bus
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

    pub fn create_emitter(&self, execution_id: ExecutionId) -> EventEmitter {
        EventEmitter {
            execution_id,
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
