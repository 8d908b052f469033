//! Task execution collaborator
//!
//! The executor core only needs [`TaskExecutor::run`]. [`ActionRegistry`]
//! is the stock implementation: it resolves each task's kind to a
//! registered [`NodeAction`] by name.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::dag::{Task, TaskId};
use crate::security::PermissionLevel;
use crate::storage::checkpoint::ResultSummary;

/// Context handed to a running task (immutable, clonable)
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: String,
    pub layer_index: usize,
    /// Level granted for this attempt; differs from the task's tag after an
    /// approved escalation
    pub permission_level: PermissionLevel,
    /// 1 for the first run, 2 for the single post-escalation retry
    pub attempt: u32,
    /// Summaries of the task's dependencies
    pub dependency_results: BTreeMap<TaskId, ResultSummary>,
}

/// Settled result of one task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskOutput {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Runs tasks on behalf of the executor. Opaque beyond success or failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// An `Err` is treated like a failed [`TaskOutput`] carrying its message.
    async fn run(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<TaskOutput>;
}

/// A named, compute-only runnable
#[async_trait]
pub trait NodeAction: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &TaskContext, payload: &Value) -> anyhow::Result<Value>;

    /// Optional: validate the payload before execution
    fn validate_inputs(&self, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registry for node actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn NodeAction>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: Arc<dyn NodeAction>) {
        let mut actions = self.actions.write();
        actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeAction>> {
        self.actions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.actions.read().keys().cloned().collect()
    }
}

#[async_trait]
impl TaskExecutor for ActionRegistry {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<TaskOutput> {
        let target = task.kind.target();
        let action = match self.get(target) {
            Some(action) => action,
            None => {
                return Ok(TaskOutput::failure(format!(
                    "Action '{}' not registered for task '{}'",
                    target, task.id
                )))
            }
        };

        let payload = task.kind.payload();
        if let Err(e) = action.validate_inputs(payload) {
            return Ok(TaskOutput::failure(format!("Invalid inputs: {}", e)));
        }

        let start = Instant::now();
        let result = action.execute(ctx, payload).await;
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(task_id = %task.id, action = target, elapsed_ms = elapsed, "Action finished");

        Ok(match result {
            Ok(value) => TaskOutput::success(value).with_duration(elapsed),
            Err(e) => TaskOutput::failure(e.to_string()).with_duration(elapsed),
        })
    }
}

/// Returns its payload unchanged
pub struct EchoAction;

#[async_trait]
impl NodeAction for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, _ctx: &TaskContext, payload: &Value) -> anyhow::Result<Value> {
        Ok(payload.clone())
    }
}
