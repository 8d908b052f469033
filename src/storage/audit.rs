//! Append-only audit trail of permission escalation decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use super::{decode_record, encode_record};
use crate::core::errors::Result;
use crate::security::PermissionLevel;

const AUDIT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub task_id: String,
    /// Capability or action the task was running
    pub capability_id: String,
    pub from_level: PermissionLevel,
    pub to_level: PermissionLevel,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub reason: String,
}

/// Escalation decisions keyed by time, stored in the `escalation_audit` tree
pub struct EscalationAuditLog {
    db: sled::Db,
    tree: sled::Tree,
    seq: AtomicU32,
}

impl EscalationAuditLog {
    pub fn new(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree("escalation_audit")?;
        Ok(Self {
            db,
            tree,
            seq: AtomicU32::new(0),
        })
    }

    pub fn temporary() -> Result<Self> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    /// Appends an entry and flushes it to disk
    pub async fn record(&self, entry: &EscalationAuditEntry) -> Result<()> {
        let nanos = entry.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let mut key = Vec::with_capacity(12);
        key.extend_from_slice(&nanos.to_be_bytes());
        key.extend_from_slice(&self.seq.fetch_add(1, Ordering::SeqCst).to_be_bytes());

        self.tree
            .insert(key, encode_record(entry, AUDIT_COMPRESSION_LEVEL)?)?;
        self.db.flush_async().await?;

        info!(
            workflow_id = %entry.workflow_id,
            task_id = %entry.task_id,
            from = %entry.from_level,
            to = %entry.to_level,
            approved = entry.approved,
            "Recorded escalation decision"
        );
        Ok(())
    }

    /// All entries in chronological order
    pub fn list(&self) -> Result<Vec<EscalationAuditEntry>> {
        self.tree
            .iter()
            .values()
            .map(|bytes| decode_record(&bytes?))
            .collect()
    }

    pub fn for_workflow(&self, workflow_id: &str) -> Result<Vec<EscalationAuditEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(workflow_id: &str, approved: bool) -> EscalationAuditEntry {
        EscalationAuditEntry {
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            task_id: "fetch".into(),
            capability_id: "http:get".into(),
            from_level: PermissionLevel::Readonly,
            to_level: PermissionLevel::Network,
            approved,
            approved_by: approved.then(|| "alice".to_string()),
            reason: "Requires net access to \"api.example.com\"".into(),
        }
    }

    #[tokio::test]
    async fn test_record_and_filter() {
        let log = EscalationAuditLog::temporary().unwrap();
        log.record(&entry("wf-a", true)).await.unwrap();
        log.record(&entry("wf-b", false)).await.unwrap();
        log.record(&entry("wf-a", false)).await.unwrap();

        assert_eq!(log.len(), 3);
        let a = log.for_workflow("wf-a").unwrap();
        assert_eq!(a.len(), 2);
        assert!(a[0].approved);
        assert_eq!(a[0].approved_by.as_deref(), Some("alice"));
        assert!(!a[1].approved);
    }
}
