//! Checkpoint store
//!
//! After every settled layer the executor persists the minimum needed to
//! resume: per-task result summaries, the layer index and any tasks added
//! by replanning. Payloads stay out of checkpoints; only a short preview of
//! each output is kept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{decode_record, encode_record};
use crate::core::config::CheckpointConfig;
use crate::core::errors::{ControlError, Result};
use crate::dag_flow::action::TaskOutput;
use crate::dag_flow::dag::{Task, TaskId};
use crate::learning::ExecutionMode;
use crate::security::PermissionLevel;

pub type CheckpointId = u64;

const PREVIEW_LIMIT: usize = 256;

/// Final status of a task within a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Declined at a decision gate
    Rejected,
    /// Pruned because a dependency did not succeed
    Skipped,
}

/// Metadata about a settled task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub status: TaskStatus,
    pub mode: Option<ExecutionMode>,
    pub attempts: u32,
    pub permission_level: PermissionLevel,
    pub escalated: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub output_preview: Option<String>,
}

impl ResultSummary {
    pub fn from_output(
        output: &TaskOutput,
        mode: Option<ExecutionMode>,
        attempts: u32,
        permission_level: PermissionLevel,
    ) -> Self {
        let output_preview = output.output.as_ref().map(|v| {
            let text = v.to_string();
            match text.char_indices().nth(PREVIEW_LIMIT) {
                Some((cut, _)) => format!("{}...", &text[..cut]),
                None => text,
            }
        });

        Self {
            status: if output.success {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            },
            mode,
            attempts,
            permission_level,
            escalated: attempts > 1,
            duration_ms: output.duration_ms,
            error: output.error.clone(),
            output_preview,
        }
    }

    pub fn rejected(mode: Option<ExecutionMode>, level: PermissionLevel, reason: String) -> Self {
        Self::not_run(TaskStatus::Rejected, mode, level, reason)
    }

    pub fn skipped(level: PermissionLevel, reason: String) -> Self {
        Self::not_run(TaskStatus::Skipped, None, level, reason)
    }

    fn not_run(
        status: TaskStatus,
        mode: Option<ExecutionMode>,
        permission_level: PermissionLevel,
        reason: String,
    ) -> Self {
        Self {
            status,
            mode,
            attempts: 0,
            permission_level,
            escalated: false,
            duration_ms: 0,
            error: Some(reason),
            output_preview: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Resumable state of a workflow after a settled layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Assigned by the store on save
    pub checkpoint_id: CheckpointId,
    pub workflow_id: String,
    /// Last settled layer
    pub layer_index: usize,
    pub completed_task_results: BTreeMap<TaskId, ResultSummary>,
    /// Tasks added by replanning, re-spliced on resume
    #[serde(default)]
    pub replanned_tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(
        workflow_id: impl Into<String>,
        layer_index: usize,
        completed_task_results: BTreeMap<TaskId, ResultSummary>,
    ) -> Self {
        Self {
            checkpoint_id: 0,
            workflow_id: workflow_id.into(),
            layer_index,
            completed_task_results,
            replanned_tasks: Vec::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_replanned_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.replanned_tasks = tasks;
        self
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Persistence for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists the checkpoint durably and returns its new id
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId>;

    async fn load(&self, checkpoint_id: CheckpointId) -> Result<Checkpoint>;

    /// Returns whether a checkpoint was removed
    async fn delete(&self, checkpoint_id: CheckpointId) -> Result<bool>;

    async fn latest_for_workflow(&self, workflow_id: &str) -> Result<Option<Checkpoint>>;

    /// Removes expired checkpoints of inactive workflows
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn mark_active(&self, workflow_id: &str);

    fn mark_inactive(&self, workflow_id: &str);

    fn is_active(&self, workflow_id: &str) -> bool;
}

fn ttl_duration(config: &CheckpointConfig) -> Option<chrono::Duration> {
    i64::try_from(config.ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
}

fn expiry(created_at: DateTime<Utc>, ttl: Option<chrono::Duration>) -> Result<DateTime<Utc>> {
    ttl.and_then(|ttl| created_at.checked_add_signed(ttl))
        .ok_or_else(|| ControlError::Config("checkpoint ttl is out of range".into()))
}

/// Sled-backed checkpoint store
pub struct SledCheckpointStore {
    db: sled::Db,
    checkpoints: sled::Tree,
    by_workflow: sled::Tree,
    ttl: Option<chrono::Duration>,
    compression_level: i32,
    active: DashSet<String>,
}

impl SledCheckpointStore {
    pub fn open(path: impl AsRef<Path>, config: &CheckpointConfig) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened checkpoint store");
        Self::with_db(db, config)
    }

    /// A store that is removed when dropped
    pub fn temporary(config: &CheckpointConfig) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, config)
    }

    pub fn with_db(db: sled::Db, config: &CheckpointConfig) -> Result<Self> {
        Ok(Self {
            checkpoints: db.open_tree("checkpoints")?,
            by_workflow: db.open_tree("checkpoints_by_workflow")?,
            db,
            ttl: ttl_duration(config),
            compression_level: config.compression_level,
            active: DashSet::new(),
        })
    }

    /// The underlying database, shared with the audit log
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn get(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>> {
        match self.checkpoints.get(checkpoint_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .remove(checkpoint.checkpoint_id.to_be_bytes())?;
        let id_bytes = checkpoint.checkpoint_id.to_be_bytes();
        // Only drop the index entry if it still points at this checkpoint
        let _ = self.by_workflow.compare_and_swap(
            checkpoint.workflow_id.as_bytes(),
            Some(&id_bytes[..]),
            None as Option<&[u8]>,
        )?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SledCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<CheckpointId> {
        let checkpoint_id = self.db.generate_id()?;
        checkpoint.checkpoint_id = checkpoint_id;
        checkpoint.expires_at = Some(expiry(checkpoint.created_at, self.ttl)?);

        let record = encode_record(&checkpoint, self.compression_level)?;
        self.checkpoints.insert(checkpoint_id.to_be_bytes(), record)?;
        self.by_workflow.insert(
            checkpoint.workflow_id.as_bytes(),
            &checkpoint_id.to_be_bytes()[..],
        )?;
        self.db.flush_async().await?;

        debug!(
            workflow_id = %checkpoint.workflow_id,
            checkpoint_id,
            layer = checkpoint.layer_index,
            "Saved checkpoint"
        );
        Ok(checkpoint_id)
    }

    async fn load(&self, checkpoint_id: CheckpointId) -> Result<Checkpoint> {
        self.get(checkpoint_id)?
            .ok_or(ControlError::CheckpointNotFound { checkpoint_id })
    }

    async fn delete(&self, checkpoint_id: CheckpointId) -> Result<bool> {
        let Some(checkpoint) = self.get(checkpoint_id)? else {
            return Ok(false);
        };
        self.remove(&checkpoint)?;
        self.db.flush_async().await?;
        debug!(checkpoint_id, "Deleted checkpoint");
        Ok(true)
    }

    async fn latest_for_workflow(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        let Some(id_bytes) = self.by_workflow.get(workflow_id.as_bytes())? else {
            return Ok(None);
        };
        let mut raw = [0u8; 8];
        if id_bytes.len() != raw.len() {
            return Err(ControlError::Internal(format!(
                "Corrupt checkpoint index entry for workflow {}",
                workflow_id
            )));
        }
        raw.copy_from_slice(&id_bytes);
        self.get(CheckpointId::from_be_bytes(raw))
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = Vec::new();
        for entry in self.checkpoints.iter() {
            let (_, bytes) = entry?;
            let checkpoint: Checkpoint = decode_record(&bytes)?;
            if checkpoint.is_expired(now) && !self.is_active(&checkpoint.workflow_id) {
                expired.push(checkpoint);
            }
        }

        for checkpoint in &expired {
            self.remove(checkpoint)?;
        }
        if !expired.is_empty() {
            self.db.flush_async().await?;
        }
        Ok(expired.len())
    }

    fn mark_active(&self, workflow_id: &str) {
        self.active.insert(workflow_id.to_string());
    }

    fn mark_inactive(&self, workflow_id: &str) {
        self.active.remove(workflow_id);
    }

    fn is_active(&self, workflow_id: &str) -> bool {
        self.active.contains(workflow_id)
    }
}

/// In-process checkpoint store with the same semantics as the sled one
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<CheckpointId, Checkpoint>,
    by_workflow: DashMap<String, CheckpointId>,
    next_id: AtomicU64,
    ttl: Option<chrono::Duration>,
    active: DashSet<String>,
}

impl MemoryCheckpointStore {
    pub fn new(config: &CheckpointConfig) -> Self {
        Self {
            checkpoints: DashMap::new(),
            by_workflow: DashMap::new(),
            next_id: AtomicU64::new(1),
            ttl: ttl_duration(config),
            active: DashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    fn remove(&self, checkpoint_id: CheckpointId) -> bool {
        match self.checkpoints.remove(&checkpoint_id) {
            Some((_, checkpoint)) => {
                self.by_workflow
                    .remove_if(&checkpoint.workflow_id, |_, latest| *latest == checkpoint_id);
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new(&CheckpointConfig::default())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<CheckpointId> {
        let checkpoint_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        checkpoint.checkpoint_id = checkpoint_id;
        checkpoint.expires_at = Some(expiry(checkpoint.created_at, self.ttl)?);
        self.by_workflow
            .insert(checkpoint.workflow_id.clone(), checkpoint_id);
        self.checkpoints.insert(checkpoint_id, checkpoint);
        Ok(checkpoint_id)
    }

    async fn load(&self, checkpoint_id: CheckpointId) -> Result<Checkpoint> {
        self.checkpoints
            .get(&checkpoint_id)
            .map(|c| c.value().clone())
            .ok_or(ControlError::CheckpointNotFound { checkpoint_id })
    }

    async fn delete(&self, checkpoint_id: CheckpointId) -> Result<bool> {
        Ok(self.remove(checkpoint_id))
    }

    async fn latest_for_workflow(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        let Some(id) = self.by_workflow.get(workflow_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.checkpoints.get(&id).map(|c| c.value().clone()))
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<CheckpointId> = self
            .checkpoints
            .iter()
            .filter(|c| c.is_expired(now) && !self.is_active(&c.workflow_id))
            .map(|c| c.checkpoint_id)
            .collect();
        Ok(expired.into_iter().filter(|id| self.remove(*id)).count())
    }

    fn mark_active(&self, workflow_id: &str) {
        self.active.insert(workflow_id.to_string());
    }

    fn mark_inactive(&self, workflow_id: &str) {
        self.active.remove(workflow_id);
    }

    fn is_active(&self, workflow_id: &str) -> bool {
        self.active.contains(workflow_id)
    }
}

/// Sweeps expired checkpoints on a fixed interval until aborted
pub fn spawn_checkpoint_janitor(
    store: Arc<dyn CheckpointStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.cleanup_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Removed expired checkpoints"),
                Err(e) => error!("Checkpoint cleanup failed: {}", e),
            }
        }
    })
}
