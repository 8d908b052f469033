//! Planning collaborator
//!
//! The Suggester proposes DAGs and replanned continuations. The executor
//! only consumes it; how tasks are proposed is outside this crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::dag::{Dag, Task, TaskId};
use crate::storage::checkpoint::ResultSummary;

/// The DAG as seen at a replan point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDag {
    pub dag: Dag,
    /// Settled tasks so far
    pub completed: BTreeMap<TaskId, ResultSummary>,
    /// First layer that has not run yet
    pub next_layer: usize,
}

impl PartialDag {
    /// Tasks scheduled but not yet run
    pub fn remaining(&self) -> impl Iterator<Item = &Task> {
        self.dag
            .layers()
            .iter()
            .skip(self.next_layer)
            .flatten()
    }
}

#[async_trait]
pub trait Suggester: Send + Sync {
    async fn suggest_initial_dag(&self, intent: &str) -> anyhow::Result<Dag>;

    /// Additional tasks to splice after the current layer. Returned groups
    /// are flattened; placement follows each task's dependencies.
    async fn replan(
        &self,
        workflow_id: &str,
        delta: &str,
        partial: &PartialDag,
    ) -> anyhow::Result<Vec<Vec<Task>>>;
}

/// Suggester answering from fixed tables, for embedding and tests
#[derive(Default)]
pub struct StaticSuggester {
    dags: Mutex<HashMap<String, Dag>>,
    replans: Mutex<HashMap<String, Vec<Vec<Task>>>>,
}

impl StaticSuggester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dag(self, intent: impl Into<String>, dag: Dag) -> Self {
        self.dags.lock().insert(intent.into(), dag);
        self
    }

    pub fn with_replan(self, delta: impl Into<String>, layers: Vec<Vec<Task>>) -> Self {
        self.replans.lock().insert(delta.into(), layers);
        self
    }
}

#[async_trait]
impl Suggester for StaticSuggester {
    async fn suggest_initial_dag(&self, intent: &str) -> anyhow::Result<Dag> {
        self.dags
            .lock()
            .get(intent)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No plan for intent '{}'", intent))
    }

    async fn replan(
        &self,
        _workflow_id: &str,
        delta: &str,
        _partial: &PartialDag,
    ) -> anyhow::Result<Vec<Vec<Task>>> {
        self.replans
            .lock()
            .get(delta)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Cannot replan for '{}'", delta))
    }
}
