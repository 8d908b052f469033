//! Controlled layered DAG execution
//!
//! Runs a DAG layer by layer with bounded intra-layer parallelism, lets an
//! external actor steer the run through a per-workflow command queue and
//! decision gates, checkpoints after every layer, and adapts its confidence
//! thresholds from execution outcomes.

// Core infrastructure modules
pub mod core;

pub mod coord; // Command queue and decision gates
pub mod dag_flow; // DAGs and the controlled executor
pub mod learning; // Adaptive confidence thresholds
pub mod security; // Permission escalation
pub mod storage; // Checkpoints and escalation audit

// Re-exports for convenience
pub use crate::core::config::{CheckpointConfig, ExecutorConfig, ThresholdConfig};
pub use crate::core::errors::{ControlError, Result};
pub use coord::{Command, CommandQueue, CommandType, DecisionRequest, GateKind};
pub use dag_flow::{
    ActionRegistry, ControlledExecutor, Dag, EventEnvelope, EventStream, ExecutionEvent,
    ExecutionHandle, ExecutionOptions, ExecutionState, ExecutionUpdate, LayerResult, NodeAction,
    Suggester, Task, TaskContext, TaskExecutor, TaskKind, TaskOutput, TerminalResult,
    TerminalStatus,
};
pub use learning::{AdaptiveThresholdController, ExecutionMode, ExecutionRecord, ThresholdState};
pub use security::{suggest_escalation, PermissionEscalationRequest, PermissionLevel};
pub use storage::{
    Checkpoint, CheckpointId, CheckpointStore, MemoryCheckpointStore, SledCheckpointStore,
};
