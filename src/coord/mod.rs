//! Steering a running workflow
//!
//! [`CommandQueue`] carries commands from external actors; [`DecisionGate`]
//! is the executor's only voluntary suspension point.

pub mod command_queue;
pub mod gate;

pub use command_queue::{Command, CommandQueue, CommandType, GateGuard, OpenGateInfo};
pub use gate::{DecisionGate, DecisionRequest, GateKind, GateResolution, PendingTask};
