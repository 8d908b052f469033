//! Per-workflow command queue
//!
//! External actors steer a running workflow by enqueuing [`Command`]s. Each
//! workflow owns one slot with a FIFO channel and at most one open gate.
//! A command other than `abort` is only accepted while a gate expecting its
//! type is open and still unresolved; everything else is rejected to the
//! sender and never reaches the executor.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::errors::{ControlError, Result};

/// Control command addressed to one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Continue {
        workflow_id: String,
    },
    Abort {
        workflow_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Replan {
        workflow_id: String,
        /// Natural-language description of the change
        delta: String,
    },
    Approve {
        workflow_id: String,
        /// `false` rejects
        approved: bool,
        #[serde(default)]
        feedback: Option<String>,
        #[serde(default)]
        approved_by: Option<String>,
    },
}

impl Command {
    pub fn continue_(workflow_id: impl Into<String>) -> Self {
        Self::Continue {
            workflow_id: workflow_id.into(),
        }
    }

    pub fn abort(workflow_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Abort {
            workflow_id: workflow_id.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn replan(workflow_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::Replan {
            workflow_id: workflow_id.into(),
            delta: delta.into(),
        }
    }

    pub fn approve(workflow_id: impl Into<String>, approved_by: Option<String>) -> Self {
        Self::Approve {
            workflow_id: workflow_id.into(),
            approved: true,
            feedback: None,
            approved_by,
        }
    }

    pub fn reject(workflow_id: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self::Approve {
            workflow_id: workflow_id.into(),
            approved: false,
            feedback: Some(feedback.into()),
            approved_by: None,
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            Self::Continue { workflow_id }
            | Self::Abort { workflow_id, .. }
            | Self::Replan { workflow_id, .. }
            | Self::Approve { workflow_id, .. } => workflow_id,
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Continue { .. } => CommandType::Continue,
            Self::Abort { .. } => CommandType::Abort,
            Self::Replan { .. } => CommandType::Replan,
            Self::Approve { .. } => CommandType::Approve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Continue,
    Abort,
    Replan,
    Approve,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
            Self::Replan => "replan",
            Self::Approve => "approve",
        };
        f.write_str(name)
    }
}

/// Description of the gate currently open for a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct OpenGateInfo {
    pub gate_id: u64,
    pub expected: Vec<CommandType>,
}

struct OpenGate {
    info: OpenGateInfo,
    resolved: bool,
}

struct WorkflowSlot {
    tx: mpsc::UnboundedSender<(u64, Command)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, Command)>>,
    gate: Mutex<Option<OpenGate>>,
    pending_abort: Mutex<Option<String>>,
}

impl WorkflowSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            gate: Mutex::new(None),
            pending_abort: Mutex::new(None),
        }
    }
}

/// Shared by every workflow; slots are independent so commands for one
/// workflow never wait on another.
#[derive(Clone, Default)]
pub struct CommandQueue {
    slots: Arc<DashMap<String, Arc<WorkflowSlot>>>,
    next_gate_id: Arc<AtomicU64>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the slot for a workflow about to run
    pub fn register(&self, workflow_id: &str) -> Result<()> {
        match self.slots.entry(workflow_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ControlError::WorkflowAlreadyRunning {
                    workflow_id: workflow_id.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(WorkflowSlot::new()));
                Ok(())
            }
        }
    }

    /// Drops the slot; later commands for the workflow are rejected
    pub fn unregister(&self, workflow_id: &str) {
        self.slots.remove(workflow_id);
    }

    pub fn is_registered(&self, workflow_id: &str) -> bool {
        self.slots.contains_key(workflow_id)
    }

    fn slot(&self, workflow_id: &str) -> Result<Arc<WorkflowSlot>> {
        self.slots
            .get(workflow_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ControlError::UnknownWorkflow {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Delivers a command to the workflow it names.
    ///
    /// `abort` is accepted at any time and also takes effect at the next
    /// layer boundary. Other commands need an open, unresolved gate that
    /// expects their type.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        let workflow_id = command.workflow_id().to_string();
        let slot = self.slot(&workflow_id)?;
        let command_type = command.command_type();

        if let Command::Abort { reason, .. } = &command {
            let mut pending = slot.pending_abort.lock();
            if pending.is_none() {
                *pending = Some(reason.clone().unwrap_or_else(|| "aborted".to_string()));
            }
        }

        let mut gate = slot.gate.lock();
        let open = match gate.as_mut() {
            Some(open) => open,
            None if command_type == CommandType::Abort => {
                debug!(workflow_id = %workflow_id, "Abort queued for next layer boundary");
                return Ok(());
            }
            None => {
                warn!(workflow_id = %workflow_id, command = %command_type, "Rejected command: no open gate");
                return Err(ControlError::out_of_sequence(
                    &workflow_id,
                    command_type,
                    "no decision gate is open",
                ));
            }
        };

        if open.resolved {
            if command_type == CommandType::Abort {
                return Ok(());
            }
            warn!(workflow_id = %workflow_id, command = %command_type, "Rejected command: gate already resolved");
            return Err(ControlError::out_of_sequence(
                &workflow_id,
                command_type,
                "the open gate has already been resolved",
            ));
        }

        if !open.info.expected.contains(&command_type) {
            warn!(workflow_id = %workflow_id, command = %command_type, "Rejected command: not expected by gate");
            return Err(ControlError::out_of_sequence(
                &workflow_id,
                command_type,
                format!("gate {} does not accept this command", open.info.gate_id),
            ));
        }

        slot.tx
            .send((open.info.gate_id, command))
            .map_err(|_| ControlError::ChannelClosed {
                workflow_id: workflow_id.clone(),
            })?;
        open.resolved = true;
        debug!(workflow_id = %workflow_id, gate_id = open.info.gate_id, command = %command_type, "Command accepted");
        Ok(())
    }

    /// Opens the single gate a workflow may have. Fails fast if one is
    /// already open.
    pub fn open_gate(&self, workflow_id: &str, expected: &[CommandType]) -> Result<GateGuard> {
        let slot = self.slot(workflow_id)?;
        let mut gate = slot.gate.lock();
        if gate.is_some() {
            return Err(ControlError::GateAlreadyOpen {
                workflow_id: workflow_id.to_string(),
            });
        }

        let gate_id = self.next_gate_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut expected = expected.to_vec();
        if !expected.contains(&CommandType::Abort) {
            expected.push(CommandType::Abort);
        }
        *gate = Some(OpenGate {
            info: OpenGateInfo { gate_id, expected },
            resolved: false,
        });
        drop(gate);

        Ok(GateGuard {
            workflow_id: workflow_id.to_string(),
            gate_id,
            slot,
        })
    }

    /// Opens a gate and waits for the matching command. `None` on timeout.
    pub async fn wait_for(
        &self,
        workflow_id: &str,
        expected: &[CommandType],
        timeout: Duration,
    ) -> Result<Option<Command>> {
        let guard = self.open_gate(workflow_id, expected)?;
        guard.wait(timeout).await
    }

    pub fn open_gate_info(&self, workflow_id: &str) -> Option<OpenGateInfo> {
        let slot = self.slots.get(workflow_id)?;
        let gate = slot.gate.lock();
        gate.as_ref().map(|g| g.info.clone())
    }

    /// Abort requested outside a gate, if any; consumed by the caller
    pub fn take_pending_abort(&self, workflow_id: &str) -> Option<String> {
        let slot = self.slots.get(workflow_id)?;
        let reason = slot.pending_abort.lock().take();
        reason
    }
}

/// An open gate. Dropping it closes the gate.
pub struct GateGuard {
    workflow_id: String,
    gate_id: u64,
    slot: Arc<WorkflowSlot>,
}

impl GateGuard {
    pub fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Waits for the command resolving this gate
    pub async fn wait(&self, timeout: Duration) -> Result<Option<Command>> {
        let mut rx = self.slot.rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;

        // An abort that arrived before the gate opened resolves it at once
        if let Some(reason) = self.slot.pending_abort.lock().take() {
            return Ok(Some(Command::Abort {
                workflow_id: self.workflow_id.clone(),
                reason: Some(reason),
            }));
        }

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    if !self.close_on_timeout() {
                        return Ok(None);
                    }
                    // Accepted just as the deadline passed
                    while let Ok((gate_id, command)) = rx.try_recv() {
                        if gate_id == self.gate_id {
                            return Ok(Some(self.settle(command)));
                        }
                    }
                    return Ok(None);
                }
                Ok(None) => {
                    return Err(ControlError::ChannelClosed {
                        workflow_id: self.workflow_id.clone(),
                    })
                }
                // Left over from a gate that timed out as it was answered
                Ok(Some((gate_id, _))) if gate_id != self.gate_id => continue,
                Ok(Some((_, command))) => return Ok(Some(self.settle(command))),
            }
        }
    }

    fn settle(&self, command: Command) -> Command {
        if command.command_type() == CommandType::Abort {
            self.slot.pending_abort.lock().take();
        }
        command
    }

    /// Marks the gate resolved so late commands are rejected. Returns true
    /// if a command was accepted before the gate could be closed.
    fn close_on_timeout(&self) -> bool {
        let mut gate = self.slot.gate.lock();
        match gate.as_mut() {
            Some(open) if open.info.gate_id == self.gate_id => {
                let answered = open.resolved;
                open.resolved = true;
                answered
            }
            _ => false,
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut gate = self.slot.gate.lock();
        if gate.as_ref().map_or(false, |g| g.info.gate_id == self.gate_id) {
            *gate = None;
        }
    }
}
