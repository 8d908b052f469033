//! Decision gates
//!
//! A gate suspends one workflow's control loop until a matching command
//! arrives on its queue slot or the timeout elapses. Every gate is
//! announced with a `decision_required` event carrying enough context to
//! decide, and closed with `decision_resolved`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::command_queue::{Command, CommandQueue, CommandType};
use crate::core::errors::Result;
use crate::dag_flow::dag::TaskId;
use crate::dag_flow::events::{EventStream, ExecutionEvent};
use crate::learning::ExecutionMode;
use crate::security::PermissionEscalationRequest;

/// Why a gate was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Between layers, on per-layer validation or a configured layer gate
    LayerValidation,
    /// Before a task flagged as risky
    RiskyTask,
    /// Before a task whose confidence needs confirmation
    Suggestion,
    /// Before retrying a task at a higher permission level
    Escalation,
}

impl GateKind {
    /// Commands that resolve this kind of gate; abort is always accepted
    pub fn expected_commands(self) -> &'static [CommandType] {
        match self {
            Self::LayerValidation => &[
                CommandType::Continue,
                CommandType::Replan,
                CommandType::Approve,
                CommandType::Abort,
            ],
            Self::RiskyTask | Self::Suggestion | Self::Escalation => {
                &[CommandType::Approve, CommandType::Abort]
            }
        }
    }
}

/// A task awaiting a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub confidence: Option<f64>,
    pub mode: Option<ExecutionMode>,
    pub description: String,
}

/// Context published with `decision_required`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub workflow_id: String,
    /// Filled in when the gate opens
    pub gate_id: u64,
    pub kind: GateKind,
    pub layer_index: usize,
    pub pending_tasks: Vec<PendingTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<PermissionEscalationRequest>,
    pub expected: Vec<CommandType>,
    pub timeout_secs: u64,
}

impl DecisionRequest {
    pub fn new(workflow_id: impl Into<String>, kind: GateKind, layer_index: usize) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            gate_id: 0,
            kind,
            layer_index,
            pending_tasks: Vec::new(),
            escalation: None,
            expected: kind.expected_commands().to_vec(),
            timeout_secs: 0,
        }
    }

    pub fn with_pending(mut self, tasks: Vec<PendingTask>) -> Self {
        self.pending_tasks = tasks;
        self
    }

    pub fn with_escalation(mut self, request: PermissionEscalationRequest) -> Self {
        self.escalation = Some(request);
        self
    }
}

/// How a gate was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum GateResolution {
    Continue,
    Abort { reason: String },
    Replan { delta: String },
    Approved {
        feedback: Option<String>,
        approved_by: Option<String>,
    },
    Rejected { feedback: Option<String> },
    TimedOut,
}

impl GateResolution {
    fn from_command(command: Command) -> Self {
        match command {
            Command::Continue { .. } => Self::Continue,
            Command::Abort { reason, .. } => Self::Abort {
                reason: reason.unwrap_or_else(|| "aborted".to_string()),
            },
            Command::Replan { delta, .. } => Self::Replan { delta },
            Command::Approve {
                approved: true,
                feedback,
                approved_by,
                ..
            } => Self::Approved {
                feedback,
                approved_by,
            },
            Command::Approve { feedback, .. } => Self::Rejected { feedback },
        }
    }

    /// Short label used in `decision_resolved` events
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Abort { .. } => "abort",
            Self::Replan { .. } => "replan",
            Self::Approved { .. } => "approved",
            Self::Rejected { .. } => "rejected",
            Self::TimedOut => "timeout",
        }
    }
}

/// Raises gates for one executor
#[derive(Clone)]
pub struct DecisionGate {
    commands: CommandQueue,
    events: EventStream,
    timeout: Duration,
}

impl DecisionGate {
    pub fn new(commands: CommandQueue, events: EventStream, timeout: Duration) -> Self {
        Self {
            commands,
            events,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks the calling workflow until the gate resolves
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, kind = ?request.kind))]
    pub async fn raise(&self, mut request: DecisionRequest) -> Result<GateResolution> {
        let guard = self
            .commands
            .open_gate(&request.workflow_id, &request.expected)?;
        request.gate_id = guard.gate_id();
        request.timeout_secs = self.timeout.as_secs();

        let workflow_id = request.workflow_id.clone();
        let kind = request.kind;
        info!(
            gate_id = request.gate_id,
            layer = request.layer_index,
            pending = request.pending_tasks.len(),
            "Waiting for decision"
        );
        self.events
            .emit(&workflow_id, ExecutionEvent::DecisionRequired { request });

        let resolution = match guard.wait(self.timeout).await? {
            Some(command) => GateResolution::from_command(command),
            None => {
                warn!(gate_id = guard.gate_id(), "Decision gate timed out");
                GateResolution::TimedOut
            }
        };
        let gate_id = guard.gate_id();
        drop(guard);

        self.events.emit(
            &workflow_id,
            ExecutionEvent::DecisionResolved {
                gate_id,
                kind,
                resolution: resolution.label().to_string(),
            },
        );
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (CommandQueue, EventStream, DecisionGate) {
        let queue = CommandQueue::new();
        let events = EventStream::new(32);
        let gate = DecisionGate::new(queue.clone(), events.clone(), Duration::from_secs(5));
        (queue, events, gate)
    }

    #[tokio::test]
    async fn test_gate_announces_and_resolves() {
        let (queue, events, gate) = setup();
        queue.register("wf").unwrap();
        let mut sub = events.subscribe();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.raise(
                    DecisionRequest::new("wf", GateKind::Suggestion, 0).with_pending(vec![
                        PendingTask {
                            task_id: "t".into(),
                            confidence: Some(0.55),
                            mode: Some(ExecutionMode::Suggestion),
                            description: String::new(),
                        },
                    ]),
                )
                .await
            }
        });

        let announced = sub.recv().await.unwrap();
        let ExecutionEvent::DecisionRequired { request } = announced.event else {
            panic!("expected decision_required");
        };
        assert_eq!(request.pending_tasks[0].confidence, Some(0.55));
        assert!(request.gate_id > 0);

        // Continue is not valid for a task gate
        assert!(queue.enqueue(Command::continue_("wf")).is_err());
        queue
            .enqueue(Command::approve("wf", Some("ops".into())))
            .unwrap();

        let resolution = waiter.await.unwrap().unwrap();
        assert_eq!(
            resolution,
            GateResolution::Approved {
                feedback: None,
                approved_by: Some("ops".into())
            }
        );
        let resolved = sub.recv().await.unwrap();
        assert_eq!(resolved.event.kind(), "decision_resolved");
    }

    #[tokio::test]
    async fn test_gate_timeout() {
        let queue = CommandQueue::new();
        let gate = DecisionGate::new(queue.clone(), EventStream::new(8), Duration::from_millis(20));
        queue.register("wf").unwrap();
        let resolution = gate
            .raise(DecisionRequest::new("wf", GateKind::LayerValidation, 1))
            .await
            .unwrap();
        assert_eq!(resolution, GateResolution::TimedOut);
    }

    #[tokio::test]
    async fn test_gate_for_unknown_workflow() {
        let (_, _, gate) = setup();
        let err = gate
            .raise(DecisionRequest::new("ghost", GateKind::LayerValidation, 0))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
