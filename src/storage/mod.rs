//! Storage layer for the controlled executor
//!
//! Checkpoints and escalation audit entries, persisted in sled as
//! zstd-compressed JSON records.

pub mod audit;
pub mod checkpoint;

pub use audit::{EscalationAuditEntry, EscalationAuditLog};
pub use checkpoint::{
    spawn_checkpoint_janitor, Checkpoint, CheckpointId, CheckpointStore, MemoryCheckpointStore,
    ResultSummary, SledCheckpointStore, TaskStatus,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::errors::Result;

/// Serializes a record to JSON and compresses it
pub(crate) fn encode_record<T: Serialize>(value: &T, level: i32) -> Result<Vec<u8>> {
    let serialized = serde_json::to_vec(value)?;
    Ok(zstd::encode_all(&*serialized, level)?)
}

/// Reverses [`encode_record`]
pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let decompressed = zstd::decode_all(bytes)?;
    Ok(serde_json::from_slice(&decompressed)?)
}
