//! Event stream for controlled execution
//!
//! Lifecycle events are broadcast to any number of subscribers. The
//! channel overflows instead of applying backpressure, so a slow observer
//! loses the oldest events rather than stalling the executor.

use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coord::gate::{DecisionRequest, GateKind};
use crate::dag_flow::dag::TaskId;
use crate::learning::ExecutionMode;
use crate::security::{PermissionEscalationRequest, PermissionLevel};
use crate::storage::checkpoint::{CheckpointId, TaskStatus};

/// Execution lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    LayerStarted {
        layer_index: usize,
        task_ids: Vec<TaskId>,
    },
    TaskStarted {
        layer_index: usize,
        task_id: TaskId,
        mode: Option<ExecutionMode>,
        attempt: u32,
        permission_level: PermissionLevel,
    },
    /// Emitted for every task once its layer has settled
    TaskComplete {
        layer_index: usize,
        task_id: TaskId,
        status: TaskStatus,
        attempts: u32,
        duration_ms: u64,
    },
    /// Emitted as soon as an attempt fails
    TaskFailed {
        layer_index: usize,
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    LayerComplete {
        layer_index: usize,
        succeeded: usize,
        failed: usize,
        checkpoint_id: CheckpointId,
    },
    CheckpointSaved {
        layer_index: usize,
        checkpoint_id: CheckpointId,
    },
    DecisionRequired {
        request: DecisionRequest,
    },
    DecisionResolved {
        gate_id: u64,
        kind: GateKind,
        resolution: String,
    },
    EscalationRequested {
        task_id: TaskId,
        request: PermissionEscalationRequest,
    },
    DagReplanned {
        after_layer: usize,
        delta: String,
        added_tasks: Vec<TaskId>,
    },
    ReplanFailed {
        after_layer: usize,
        delta: String,
        error: String,
    },
    WorkflowComplete {
        layers_completed: usize,
        reason: String,
    },
    WorkflowAborted {
        reason: String,
    },
    WorkflowFailed {
        reason: String,
    },
}

impl ExecutionEvent {
    /// The serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LayerStarted { .. } => "layer_started",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskComplete { .. } => "task_complete",
            Self::TaskFailed { .. } => "task_failed",
            Self::LayerComplete { .. } => "layer_complete",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::DecisionRequired { .. } => "decision_required",
            Self::DecisionResolved { .. } => "decision_resolved",
            Self::EscalationRequested { .. } => "escalation_requested",
            Self::DagReplanned { .. } => "dag_replanned",
            Self::ReplanFailed { .. } => "replan_failed",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowAborted { .. } => "workflow_aborted",
            Self::WorkflowFailed { .. } => "workflow_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowComplete { .. } | Self::WorkflowAborted { .. } | Self::WorkflowFailed { .. }
        )
    }
}

/// Event with delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per stream, gaps mean a subscriber overflowed
    pub sequence: u64,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

struct StreamInner {
    tx: Sender<EventEnvelope>,
    // Keeps the channel open while nobody is subscribed
    _keepalive: InactiveReceiver<EventEnvelope>,
    sequence: AtomicU64,
}

/// Broadcast channel of [`EventEnvelope`]s shared by all workflows of an
/// executor
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        tx.set_await_active(false);
        Self {
            inner: Arc::new(StreamInner {
                tx,
                _keepalive: rx.deactivate(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Sees every event emitted after this call
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.inner.tx.new_receiver(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Never blocks
    pub fn emit(&self, workflow_id: &str, event: ExecutionEvent) {
        let envelope = EventEnvelope {
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst),
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
            event,
        };
        debug!(
            workflow_id = %envelope.workflow_id,
            sequence = envelope.sequence,
            event = envelope.event.kind(),
            "Event: {:?}",
            envelope.event
        );

        match self.inner.tx.try_broadcast(envelope) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Full(_)) => warn!("Event stream full, event dropped"),
            Err(TrySendError::Closed(_)) => warn!("Event stream closed, event dropped"),
        }
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiving end of an [`EventStream`]
pub struct EventSubscriber {
    rx: Receiver<EventEnvelope>,
}

impl EventSubscriber {
    /// Next event, skipping over any lost to overflow. `None` once the
    /// stream is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Overflowed(missed)) => {
                    warn!(missed, "Event subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(async_broadcast::TryRecvError::Overflowed(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything buffered right now
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events of one workflow up to and including its terminal event
    pub async fn collect_workflow(&mut self, workflow_id: &str) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Some(envelope) = self.recv().await {
            if envelope.workflow_id != workflow_id {
                continue;
            }
            let terminal = envelope.event.is_terminal();
            events.push(envelope);
            if terminal {
                break;
            }
        }
        events
    }
}
