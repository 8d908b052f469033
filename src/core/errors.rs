use thiserror::Error;

use crate::coord::command_queue::CommandType;

/// Unified error type for the controlled execution core
#[derive(Debug, Error)]
pub enum ControlError {
    // Input errors
    #[error("Invalid DAG: {0}")]
    InvalidDag(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Protocol violations, rejected synchronously to the caller
    #[error("Unknown workflow: {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    #[error("Workflow already running: {workflow_id}")]
    WorkflowAlreadyRunning { workflow_id: String },

    #[error("A decision gate is already open for workflow {workflow_id}")]
    GateAlreadyOpen { workflow_id: String },

    #[error("Out-of-sequence command {command:?} for workflow {workflow_id}: {reason}")]
    OutOfSequence {
        workflow_id: String,
        command: CommandType,
        reason: String,
    },

    // Checkpoint errors
    #[error("Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: u64 },

    #[error("Checkpoint {checkpoint_id} does not match the DAG: {reason}")]
    CheckpointMismatch { checkpoint_id: u64, reason: String },

    // Collaborator errors
    #[error("Suggester error: {0}")]
    Suggester(String),

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed for workflow {workflow_id}")]
    ChannelClosed { workflow_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Errors caused by a caller misusing the command protocol. These never
    /// change workflow state.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownWorkflow { .. }
                | Self::WorkflowAlreadyRunning { .. }
                | Self::GateAlreadyOpen { .. }
                | Self::OutOfSequence { .. }
        )
    }

    /// Errors that are fatal to a running workflow.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Serialization(_)
                | Self::Io(_)
                | Self::ChannelClosed { .. }
                | Self::Internal(_)
        )
    }

    pub fn out_of_sequence(
        workflow_id: impl Into<String>,
        command: CommandType,
        reason: impl Into<String>,
    ) -> Self {
        Self::OutOfSequence {
            workflow_id: workflow_id.into(),
            command,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;
