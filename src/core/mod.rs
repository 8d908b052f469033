// Core infrastructure shared by every component

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{CheckpointConfig, ExecutorConfig, ThresholdConfig};
pub use errors::{ControlError, Result};
