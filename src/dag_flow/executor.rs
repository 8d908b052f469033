//! Controlled executor
//!
//! Runs a [`Dag`] layer by layer. Each layer is dispatched with bounded
//! parallelism and settles completely before the workflow moves on. After a
//! layer the executor checkpoints, reports a [`LayerResult`] and, when asked
//! to, waits at a decision gate for an external actor to continue, abort or
//! replan. Every run ends with exactly one [`TerminalResult`].
//!
//! State machine per workflow:
//!
//! ```text
//! Idle -> LayerRunning -> LayerComplete -> GateWaiting -> LayerRunning ...
//!                                       -> Complete | Aborted | Failed
//! ```

use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::action::{TaskContext, TaskExecutor};
use super::dag::{Dag, Task, TaskId};
use super::events::{EventStream, EventSubscriber, ExecutionEvent};
use super::layer::{Dispatch, LayerRunner, Settled};
use super::planning::{PartialDag, Suggester};
use crate::coord::command_queue::{Command, CommandQueue};
use crate::coord::gate::{DecisionGate, DecisionRequest, GateKind, GateResolution, PendingTask};
use crate::core::config::ExecutorConfig;
use crate::core::errors::{ControlError, Result};
use crate::learning::{AdaptiveThresholdController, ExecutionMode, ExecutionRecord};
use crate::security::{detect_access_denial, is_permission_error, suggest_escalation};
use crate::storage::audit::{EscalationAuditEntry, EscalationAuditLog};
use crate::storage::checkpoint::{
    spawn_checkpoint_janitor, Checkpoint, CheckpointId, CheckpointStore, MemoryCheckpointStore,
    ResultSummary, TaskStatus,
};

/// Lifecycle state of one workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    LayerRunning,
    LayerComplete,
    GateWaiting,
    Complete,
    Aborted,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Failed)
    }
}

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Generated when absent
    pub workflow_id: Option<String>,
    /// Wait at a gate after every layer that has a successor
    pub per_layer_validation: bool,
    /// Resume point
    pub checkpoint_id: Option<CheckpointId>,
    /// Raise a gate before these layers
    pub gate_before_layers: BTreeSet<usize>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn per_layer_validation(mut self, enabled: bool) -> Self {
        self.per_layer_validation = enabled;
        self
    }

    pub fn resume_from(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn gate_before_layer(mut self, layer_index: usize) -> Self {
        self.gate_before_layers.insert(layer_index);
        self
    }
}

/// A settled task as reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub summary: ResultSummary,
    /// Full output; never checkpointed
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerResult {
    pub workflow_id: String,
    pub layer_index: usize,
    pub checkpoint_id: CheckpointId,
    pub tasks: Vec<TaskResult>,
}

impl LayerResult {
    pub fn task(&self, task_id: &str) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Complete,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub workflow_id: String,
    pub status: TerminalStatus,
    /// Human-readable; `"timeout"` for a gate that expired
    pub reason: String,
    pub task_results: BTreeMap<TaskId, ResultSummary>,
    pub layers_completed: usize,
    /// Kept for resuming when the run failed; deleted otherwise
    pub last_checkpoint_id: Option<CheckpointId>,
}

impl TerminalResult {
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_results.get(task_id).map(|s| s.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionUpdate {
    Layer(LayerResult),
    Terminal(TerminalResult),
}

/// Receiving side of a running workflow
pub struct ExecutionHandle {
    workflow_id: String,
    updates: mpsc::UnboundedReceiver<ExecutionUpdate>,
    join: JoinHandle<()>,
}

impl ExecutionHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Next layer or terminal result; `None` after the terminal one
    pub async fn next(&mut self) -> Option<ExecutionUpdate> {
        self.updates.recv().await
    }

    /// Skips layer results until the run ends
    pub async fn wait_terminal(mut self) -> Result<TerminalResult> {
        while let Some(update) = self.next().await {
            if let ExecutionUpdate::Terminal(result) = update {
                return Ok(result);
            }
        }
        let detail = match (&mut self.join).await {
            Err(e) => e.to_string(),
            Ok(()) => "no terminal result".to_string(),
        };
        Err(ControlError::Internal(format!(
            "Workflow {} ended abnormally: {}",
            self.workflow_id, detail
        )))
    }

    pub fn into_stream(self) -> impl Stream<Item = ExecutionUpdate> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.next().await.map(|update| (update, handle))
        })
    }
}

/// Composition root for controlled execution. Cheap to clone; all clones
/// share the queue, the event stream, the store and the thresholds.
#[derive(Clone)]
pub struct ControlledExecutor {
    config: Arc<ExecutorConfig>,
    task_executor: Arc<dyn TaskExecutor>,
    suggester: Option<Arc<dyn Suggester>>,
    checkpoints: Arc<dyn CheckpointStore>,
    commands: CommandQueue,
    events: EventStream,
    thresholds: Arc<AdaptiveThresholdController>,
    audit: Option<Arc<EscalationAuditLog>>,
    states: Arc<DashMap<String, ExecutionState>>,
}

impl ControlledExecutor {
    pub fn new(config: ExecutorConfig, task_executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            checkpoints: Arc::new(MemoryCheckpointStore::new(&config.checkpoint)),
            events: EventStream::new(config.event_capacity),
            thresholds: Arc::new(AdaptiveThresholdController::new(config.thresholds.clone())),
            config: Arc::new(config),
            task_executor,
            suggester: None,
            commands: CommandQueue::new(),
            audit: None,
            states: Arc::new(DashMap::new()),
        })
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn Suggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    /// Shares a controller between executors
    pub fn with_thresholds(mut self, thresholds: Arc<AdaptiveThresholdController>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<EscalationAuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn thresholds(&self) -> &Arc<AdaptiveThresholdController> {
        &self.thresholds
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Forwards a command to the queue
    pub fn enqueue(&self, command: Command) -> Result<()> {
        self.commands.enqueue(command)
    }

    pub fn workflow_state(&self, workflow_id: &str) -> Option<ExecutionState> {
        self.states.get(workflow_id).map(|s| *s)
    }

    /// Drops the recorded state of a finished workflow. Running workflows
    /// are left alone.
    pub fn forget(&self, workflow_id: &str) -> Option<ExecutionState> {
        self.states
            .remove_if(workflow_id, |_, state| state.is_terminal())
            .map(|(_, state)| state)
    }

    /// Drops the recorded state of every finished workflow
    pub fn forget_finished(&self) -> usize {
        let mut removed = 0;
        self.states.retain(|_, state| {
            if state.is_terminal() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Sweeps expired checkpoints of this executor's store on the
    /// configured cleanup interval until the handle is aborted.
    pub fn start_checkpoint_janitor(&self) -> JoinHandle<()> {
        debug!(
            interval_secs = self.config.checkpoint.cleanup_interval_secs,
            "Starting checkpoint janitor"
        );
        spawn_checkpoint_janitor(
            Arc::clone(&self.checkpoints),
            self.config.checkpoint.cleanup_interval(),
        )
    }

    /// Starts a run and returns its handle. Protocol and input errors are
    /// returned here; everything after is reported through the handle.
    #[instrument(skip(self, dag, options), fields(dag = %dag.name))]
    pub async fn execute(&self, dag: Dag, options: ExecutionOptions) -> Result<ExecutionHandle> {
        if dag.is_empty() {
            return Err(ControlError::InvalidDag(format!(
                "DAG '{}' has no tasks",
                dag.name
            )));
        }

        let resume_from = match options.checkpoint_id {
            Some(checkpoint_id) => Some(self.checkpoints.load(checkpoint_id).await?),
            None => None,
        };

        let workflow_id = match (&options.workflow_id, &resume_from) {
            (Some(requested), Some(cp)) if *requested != cp.workflow_id => {
                return Err(ControlError::CheckpointMismatch {
                    checkpoint_id: cp.checkpoint_id,
                    reason: format!(
                        "checkpoint belongs to workflow {}, not {}",
                        cp.workflow_id, requested
                    ),
                })
            }
            (Some(requested), _) => requested.clone(),
            (None, Some(cp)) => cp.workflow_id.clone(),
            (None, None) => cuid2::create_id(),
        };

        self.commands.register(&workflow_id)?;
        self.checkpoints.mark_active(&workflow_id);
        self.states
            .insert(workflow_id.clone(), ExecutionState::Idle);

        info!(
            workflow_id = %workflow_id,
            layers = dag.layer_count(),
            tasks = dag.len(),
            resume = resume_from.is_some(),
            "Starting workflow"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let run = WorkflowRun::new(self.clone(), workflow_id.clone(), dag, options, tx);
        let join = tokio::spawn(run.run(resume_from));

        Ok(ExecutionHandle {
            workflow_id,
            updates: rx,
            join,
        })
    }

    /// Continues a workflow from a checkpoint of the same DAG
    pub async fn resume(
        &self,
        dag: Dag,
        checkpoint_id: CheckpointId,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        self.execute(dag, options.resume_from(checkpoint_id)).await
    }

    /// Asks the suggester for a DAG and runs it
    pub async fn execute_intent(
        &self,
        intent: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        let suggester = self
            .suggester
            .as_ref()
            .ok_or_else(|| ControlError::Suggester("No suggester configured".into()))?;
        let dag = suggester
            .suggest_initial_dag(intent)
            .await
            .map_err(|e| ControlError::Suggester(e.to_string()))?;
        self.execute(dag, options).await
    }
}

/// How a run ended
struct Termination {
    status: TerminalStatus,
    reason: String,
}

impl Termination {
    fn complete(reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Complete,
            reason: reason.into(),
        }
    }

    fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Aborted,
            reason: reason.into(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            reason: reason.into(),
        }
    }

    /// Maps a gate that did not approve to a workflow abort
    fn from_gate(resolution: &GateResolution) -> Option<Self> {
        match resolution {
            GateResolution::Abort { reason } => Some(Self::aborted(reason.clone())),
            GateResolution::TimedOut => Some(Self::aborted("timeout")),
            _ => None,
        }
    }
}

enum LayerOutcome {
    Settled(Vec<TaskResult>),
    Stopped(Termination),
}

/// State of one workflow run, owned by its control loop
struct WorkflowRun {
    exec: ControlledExecutor,
    workflow_id: String,
    dag: Dag,
    options: ExecutionOptions,
    gate: DecisionGate,
    runner: LayerRunner,
    state: ExecutionState,
    completed: BTreeMap<TaskId, ResultSummary>,
    replanned: Vec<Task>,
    last_checkpoint: Option<CheckpointId>,
    layers_completed: usize,
    updates: mpsc::UnboundedSender<ExecutionUpdate>,
}

impl WorkflowRun {
    fn new(
        exec: ControlledExecutor,
        workflow_id: String,
        dag: Dag,
        options: ExecutionOptions,
        updates: mpsc::UnboundedSender<ExecutionUpdate>,
    ) -> Self {
        let gate = DecisionGate::new(
            exec.commands.clone(),
            exec.events.clone(),
            exec.config.gate_timeout(),
        );
        let runner = LayerRunner::new(
            workflow_id.clone(),
            Arc::clone(&exec.task_executor),
            exec.config.max_parallelism,
            exec.config.task_timeout(),
            exec.events.clone(),
        );
        Self {
            exec,
            workflow_id,
            dag,
            options,
            gate,
            runner,
            state: ExecutionState::Idle,
            completed: BTreeMap::new(),
            replanned: Vec::new(),
            last_checkpoint: None,
            layers_completed: 0,
            updates,
        }
    }

    fn transition(&mut self, to: ExecutionState) {
        debug!(workflow_id = %self.workflow_id, from = ?self.state, to = ?to, "State transition");
        self.state = to;
        self.exec.states.insert(self.workflow_id.clone(), to);
    }

    fn emit(&self, event: ExecutionEvent) {
        self.exec.events.emit(&self.workflow_id, event);
    }

    async fn run(mut self, resume_from: Option<Checkpoint>) {
        let termination = match self.drive(resume_from).await {
            Ok(termination) => termination,
            Err(e) => {
                error!(workflow_id = %self.workflow_id, "Workflow failed: {}", e);
                Termination::failed(e.to_string())
            }
        };
        self.finish(termination).await;
    }

    #[instrument(skip_all, fields(workflow_id = %self.workflow_id))]
    async fn drive(&mut self, resume_from: Option<Checkpoint>) -> Result<Termination> {
        let mut next_layer = 0;

        if let Some(checkpoint) = resume_from {
            match self.restore(checkpoint) {
                Ok(layer) => next_layer = layer,
                Err(reason) => return Ok(Termination::failed(reason)),
            }
            self.transition(ExecutionState::LayerComplete);
        }

        loop {
            if let Some(termination) = self.boundary(next_layer).await? {
                return Ok(termination);
            }
            if next_layer >= self.dag.layer_count() {
                break;
            }

            self.transition(ExecutionState::LayerRunning);
            let results = match self.run_layer(next_layer).await? {
                LayerOutcome::Settled(results) => results,
                LayerOutcome::Stopped(termination) => return Ok(termination),
            };
            self.settle_layer(next_layer, results).await?;
            next_layer += 1;
        }

        let failed = self
            .completed
            .values()
            .filter(|s| !s.is_success())
            .count();
        let reason = if failed == 0 {
            format!("All {} layers completed", self.layers_completed)
        } else {
            format!(
                "All {} layers completed, {} tasks did not succeed",
                self.layers_completed, failed
            )
        };
        Ok(Termination::complete(reason))
    }

    /// Loads checkpoint state and returns the first layer still to run
    fn restore(&mut self, checkpoint: Checkpoint) -> std::result::Result<usize, String> {
        let checkpoint_id = checkpoint.checkpoint_id;
        let mismatch = move |reason: String| {
            ControlError::CheckpointMismatch {
                checkpoint_id,
                reason,
            }
            .to_string()
        };

        let missing: Vec<Task> = checkpoint
            .replanned_tasks
            .iter()
            .filter(|t| !self.dag.contains(&t.id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let after = checkpoint.layer_index.min(self.dag.layer_count().saturating_sub(1));
            self.dag
                .splice(missing, after)
                .map_err(|e| mismatch(format!("replanned tasks do not fit: {}", e)))?;
        }

        if checkpoint.layer_index >= self.dag.layer_count() {
            return Err(mismatch(format!(
                "layer {} is beyond the DAG's {} layers",
                checkpoint.layer_index,
                self.dag.layer_count()
            )));
        }

        // Every task up to the checkpointed layer must have settled
        for (layer_index, layer) in self.dag.layers()[..=checkpoint.layer_index]
            .iter()
            .enumerate()
        {
            if let Some(task) = layer
                .iter()
                .find(|t| !checkpoint.completed_task_results.contains_key(&t.id))
            {
                return Err(mismatch(format!(
                    "task '{}' in layer {} has no recorded result",
                    task.id, layer_index
                )));
            }
        }

        let next_layer = checkpoint.layer_index + 1;

        info!(
            workflow_id = %self.workflow_id,
            checkpoint_id = checkpoint.checkpoint_id,
            next_layer,
            completed = checkpoint.completed_task_results.len(),
            "Resuming from checkpoint"
        );
        self.completed = checkpoint.completed_task_results;
        self.replanned = checkpoint.replanned_tasks;
        self.last_checkpoint = Some(checkpoint.checkpoint_id);
        self.layers_completed = next_layer;
        Ok(next_layer)
    }

    /// Runs between layers: honors a pending abort and raises the layer gate
    /// when one is configured for `next_layer`.
    async fn boundary(&mut self, next_layer: usize) -> Result<Option<Termination>> {
        if let Some(reason) = self.exec.commands.take_pending_abort(&self.workflow_id) {
            return Ok(Some(Termination::aborted(reason)));
        }

        if next_layer >= self.dag.layer_count() {
            return Ok(None);
        }
        let gated = (self.options.per_layer_validation && next_layer > 0)
            || self.options.gate_before_layers.contains(&next_layer);
        if !gated {
            return Ok(None);
        }

        loop {
            self.transition(ExecutionState::GateWaiting);
            let request = DecisionRequest::new(
                self.workflow_id.clone(),
                GateKind::LayerValidation,
                next_layer,
            )
            .with_pending(self.pending_tasks(next_layer));

            match self.gate.raise(request).await? {
                GateResolution::Continue | GateResolution::Approved { .. } => return Ok(None),
                GateResolution::Abort { reason } => return Ok(Some(Termination::aborted(reason))),
                GateResolution::TimedOut => return Ok(Some(Termination::aborted("timeout"))),
                GateResolution::Rejected { feedback } => {
                    let reason = match feedback {
                        Some(feedback) => format!("rejected: {}", feedback),
                        None => "rejected".to_string(),
                    };
                    return Ok(Some(Termination::aborted(reason)));
                }
                GateResolution::Replan { delta } => {
                    // Nothing to splice after before the first layer has run
                    let result = match next_layer.checked_sub(1) {
                        Some(after) => self.replan(after, &delta).await,
                        None => Err("replanning needs at least one completed layer".to_string()),
                    };
                    match result {
                        Ok(added) => {
                            self.emit(ExecutionEvent::DagReplanned {
                                after_layer: next_layer.saturating_sub(1),
                                delta,
                                added_tasks: added,
                            });
                            return Ok(None);
                        }
                        Err(error) => {
                            warn!(workflow_id = %self.workflow_id, "Replan failed: {}", error);
                            self.emit(ExecutionEvent::ReplanFailed {
                                after_layer: next_layer.saturating_sub(1),
                                delta,
                                error,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn replan(&mut self, after_layer: usize, delta: &str) -> std::result::Result<Vec<TaskId>, String> {
        let suggester = self
            .exec
            .suggester
            .clone()
            .ok_or_else(|| "No suggester configured".to_string())?;

        let partial = PartialDag {
            dag: self.dag.clone(),
            completed: self.completed.clone(),
            next_layer: after_layer + 1,
        };
        let layers = suggester
            .replan(&self.workflow_id, delta, &partial)
            .await
            .map_err(|e| e.to_string())?;

        let tasks: Vec<Task> = layers.into_iter().flatten().collect();
        let added = self
            .dag
            .splice(tasks.clone(), after_layer)
            .map_err(|e| e.to_string())?;
        self.replanned.extend(tasks);

        info!(workflow_id = %self.workflow_id, added = added.len(), "Spliced replanned tasks");
        Ok(added)
    }

    fn pending_tasks(&self, layer_index: usize) -> Vec<PendingTask> {
        let thresholds = self.exec.thresholds.get_thresholds();
        self.dag
            .layer(layer_index)
            .unwrap_or_default()
            .iter()
            .map(|task| PendingTask {
                task_id: task.id.clone(),
                confidence: task.confidence,
                mode: task.confidence.map(|c| thresholds.mode_for(c)),
                description: task.description.clone(),
            })
            .collect()
    }

    fn context_for(&self, task: &Task, layer_index: usize) -> TaskContext {
        TaskContext {
            workflow_id: self.workflow_id.clone(),
            layer_index,
            permission_level: task.permission_level,
            attempt: 1,
            dependency_results: task
                .depends_on
                .iter()
                .filter_map(|dep| self.completed.get(dep).map(|s| (dep.clone(), s.clone())))
                .collect(),
        }
    }

    #[instrument(skip(self), fields(workflow_id = %self.workflow_id))]
    async fn run_layer(&mut self, layer_index: usize) -> Result<LayerOutcome> {
        let tasks: Vec<Task> = self.dag.layer(layer_index).unwrap_or_default().to_vec();
        self.emit(ExecutionEvent::LayerStarted {
            layer_index,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
        });

        let thresholds = self.exec.thresholds.get_thresholds();
        let mut settled: BTreeMap<TaskId, TaskResult> = BTreeMap::new();
        let mut cleared = Vec::new();

        for task in &tasks {
            if self.completed.contains_key(&task.id) {
                debug!(task_id = %task.id, "Already settled, skipping");
                continue;
            }

            if let Some(dep) = task
                .depends_on
                .iter()
                .find(|dep| !self.completed.contains_key(*dep))
            {
                return Err(ControlError::CheckpointMismatch {
                    checkpoint_id: self.last_checkpoint.unwrap_or_default(),
                    reason: format!(
                        "dependency '{}' of task '{}' has no recorded result",
                        dep, task.id
                    ),
                });
            }

            if let Some(dep) = task.depends_on.iter().find(|dep| {
                !self
                    .completed
                    .get(*dep)
                    .map_or(false, ResultSummary::is_success)
            }) {
                let summary = ResultSummary::skipped(
                    task.permission_level,
                    format!("Dependency '{}' did not succeed", dep),
                );
                settled.insert(task.id.clone(), skipped_result(task, summary));
                continue;
            }

            let mode = task.confidence.map(|c| thresholds.mode_for(c));
            let needs_gate = task.risky
                || matches!(
                    mode,
                    Some(ExecutionMode::Suggestion) | Some(ExecutionMode::Explicit)
                );

            let mut dispatch = Dispatch {
                ctx: self.context_for(task, layer_index),
                task: task.clone(),
                mode,
                user_accepted: None,
            };
            if !needs_gate {
                cleared.push(dispatch);
                continue;
            }

            let kind = if task.risky {
                GateKind::RiskyTask
            } else {
                GateKind::Suggestion
            };
            self.transition(ExecutionState::GateWaiting);
            let request = DecisionRequest::new(self.workflow_id.clone(), kind, layer_index)
                .with_pending(vec![PendingTask {
                    task_id: task.id.clone(),
                    confidence: task.confidence,
                    mode,
                    description: task.description.clone(),
                }]);
            let resolution = self.gate.raise(request).await?;
            self.transition(ExecutionState::LayerRunning);

            if let Some(termination) = Termination::from_gate(&resolution) {
                return Ok(LayerOutcome::Stopped(termination));
            }
            match resolution {
                GateResolution::Approved { .. } | GateResolution::Continue => {
                    dispatch.user_accepted = Some(true);
                    cleared.push(dispatch);
                }
                GateResolution::Rejected { feedback } => {
                    if let (Some(confidence), Some(mode)) = (task.confidence, mode) {
                        self.exec.thresholds.record_execution(
                            ExecutionRecord::new(confidence, mode, false).with_user_accepted(false),
                        );
                    }
                    let reason = feedback.unwrap_or_else(|| "Rejected at decision gate".into());
                    info!(task_id = %task.id, "Task rejected: {}", reason);
                    let summary = ResultSummary::rejected(mode, task.permission_level, reason);
                    settled.insert(task.id.clone(), skipped_result(task, summary));
                }
                other => {
                    return Err(ControlError::Internal(format!(
                        "Unexpected resolution '{}' at a task gate",
                        other.label()
                    )))
                }
            }
        }

        let first_pass = self.runner.run_batch(cleared).await;
        let mut finals: Vec<(Settled, u32)> = Vec::with_capacity(first_pass.len());
        let mut retries = Vec::new();

        for outcome in first_pass {
            if outcome.output.success {
                finals.push((outcome, 1));
                continue;
            }
            match self.escalate(&outcome).await? {
                Escalation::Retry(dispatch) => retries.push(dispatch),
                Escalation::Declined => finals.push((outcome, 1)),
                Escalation::Stop(termination) => return Ok(LayerOutcome::Stopped(termination)),
            }
        }

        // At most one retry per task; retried failures are final
        if !retries.is_empty() {
            for outcome in self.runner.run_batch(retries).await {
                finals.push((outcome, 2));
            }
        }

        for (outcome, attempts) in finals {
            let Settled { dispatch, output } = outcome;
            if let (Some(confidence), Some(mode)) = (dispatch.task.confidence, dispatch.mode) {
                let mut record = ExecutionRecord::new(confidence, mode, output.success)
                    .with_execution_time(output.duration_ms);
                if let Some(accepted) = dispatch.user_accepted {
                    record = record.with_user_accepted(accepted);
                }
                self.exec.thresholds.record_execution(record);
            }

            let summary = ResultSummary::from_output(
                &output,
                dispatch.mode,
                attempts,
                dispatch.ctx.permission_level,
            );
            settled.insert(
                dispatch.task.id.clone(),
                TaskResult {
                    task_id: dispatch.task.id,
                    summary,
                    output: output.output,
                },
            );
        }

        // Report in layer order
        let results = tasks
            .iter()
            .filter_map(|t| settled.remove(&t.id))
            .collect();
        Ok(LayerOutcome::Settled(results))
    }

    /// Decides what to do with a failed first attempt
    async fn escalate(&mut self, outcome: &Settled) -> Result<Escalation> {
        let error = outcome.output.error.clone().unwrap_or_default();
        if !is_permission_error(&error) {
            return Ok(Escalation::Declined);
        }

        let task = &outcome.dispatch.task;
        let current = outcome.dispatch.ctx.permission_level;
        let Some(request) = suggest_escalation(&error, current) else {
            if detect_access_denial(&error).map_or(false, |d| d.is_security_critical()) {
                warn!(task_id = %task.id, "Refusing escalation to a security-critical level");
            } else {
                debug!(task_id = %task.id, "No escalation applies to this denial");
            }
            return Ok(Escalation::Declined);
        };

        self.emit(ExecutionEvent::EscalationRequested {
            task_id: task.id.clone(),
            request: request.clone(),
        });

        self.transition(ExecutionState::GateWaiting);
        let decision = DecisionRequest::new(
            self.workflow_id.clone(),
            GateKind::Escalation,
            outcome.dispatch.ctx.layer_index,
        )
        .with_pending(vec![PendingTask {
            task_id: task.id.clone(),
            confidence: Some(request.confidence),
            mode: outcome.dispatch.mode,
            description: request.reason.clone(),
        }])
        .with_escalation(request.clone());
        let resolution = self.gate.raise(decision).await?;
        self.transition(ExecutionState::LayerRunning);

        if let Some(termination) = Termination::from_gate(&resolution) {
            return Ok(Escalation::Stop(termination));
        }

        let (approved, approved_by) = match &resolution {
            GateResolution::Approved { approved_by, .. } => (true, approved_by.clone()),
            _ => (false, None),
        };

        if let Some(audit) = &self.exec.audit {
            audit
                .record(&EscalationAuditEntry {
                    timestamp: Utc::now(),
                    workflow_id: self.workflow_id.clone(),
                    task_id: task.id.clone(),
                    capability_id: task.kind.target().to_string(),
                    from_level: request.current_level,
                    to_level: request.requested_level,
                    approved,
                    approved_by,
                    reason: request.reason.clone(),
                })
                .await?;
        }

        if !approved {
            info!(task_id = %task.id, "Escalation declined");
            return Ok(Escalation::Declined);
        }

        info!(
            task_id = %task.id,
            from = %request.current_level,
            to = %request.requested_level,
            "Escalation approved, retrying once"
        );
        let mut retry = outcome.dispatch.clone();
        retry.ctx.permission_level = request.requested_level;
        retry.ctx.attempt = 2;
        Ok(Escalation::Retry(retry))
    }

    /// Persists the layer, then reports it
    async fn settle_layer(&mut self, layer_index: usize, results: Vec<TaskResult>) -> Result<()> {
        for result in &results {
            self.completed
                .insert(result.task_id.clone(), result.summary.clone());
        }

        let checkpoint = Checkpoint::new(self.workflow_id.clone(), layer_index, self.completed.clone())
            .with_replanned_tasks(self.replanned.clone());
        let checkpoint_id = self.exec.checkpoints.save(checkpoint).await?;
        if let Some(previous) = self.last_checkpoint.replace(checkpoint_id) {
            self.exec.checkpoints.delete(previous).await?;
        }
        self.layers_completed = layer_index + 1;
        self.transition(ExecutionState::LayerComplete);

        let mut failed = 0;
        for result in &results {
            if !result.summary.is_success() {
                failed += 1;
            }
            self.emit(ExecutionEvent::TaskComplete {
                layer_index,
                task_id: result.task_id.clone(),
                status: result.summary.status,
                attempts: result.summary.attempts,
                duration_ms: result.summary.duration_ms,
            });
        }
        self.emit(ExecutionEvent::LayerComplete {
            layer_index,
            succeeded: results.len() - failed,
            failed,
            checkpoint_id,
        });
        self.emit(ExecutionEvent::CheckpointSaved {
            layer_index,
            checkpoint_id,
        });
        info!(
            workflow_id = %self.workflow_id,
            layer = layer_index,
            checkpoint_id,
            failed,
            "Layer complete"
        );

        let _ = self.updates.send(ExecutionUpdate::Layer(LayerResult {
            workflow_id: self.workflow_id.clone(),
            layer_index,
            checkpoint_id,
            tasks: results,
        }));
        Ok(())
    }

    async fn finish(mut self, termination: Termination) {
        let (state, event) = match termination.status {
            TerminalStatus::Complete => (
                ExecutionState::Complete,
                ExecutionEvent::WorkflowComplete {
                    layers_completed: self.layers_completed,
                    reason: termination.reason.clone(),
                },
            ),
            TerminalStatus::Aborted => (
                ExecutionState::Aborted,
                ExecutionEvent::WorkflowAborted {
                    reason: termination.reason.clone(),
                },
            ),
            TerminalStatus::Failed => (
                ExecutionState::Failed,
                ExecutionEvent::WorkflowFailed {
                    reason: termination.reason.clone(),
                },
            ),
        };

        // A failed run keeps its checkpoint for resuming
        if termination.status != TerminalStatus::Failed {
            if let Some(checkpoint_id) = self.last_checkpoint.take() {
                if let Err(e) = self.exec.checkpoints.delete(checkpoint_id).await {
                    error!(workflow_id = %self.workflow_id, checkpoint_id, "Failed to delete checkpoint: {}", e);
                }
            }
        }

        self.exec.checkpoints.mark_inactive(&self.workflow_id);
        self.exec.commands.unregister(&self.workflow_id);
        self.transition(state);
        self.emit(event);

        info!(
            workflow_id = %self.workflow_id,
            status = ?termination.status,
            reason = %termination.reason,
            "Workflow finished"
        );

        let _ = self.updates.send(ExecutionUpdate::Terminal(TerminalResult {
            workflow_id: self.workflow_id.clone(),
            status: termination.status,
            reason: termination.reason,
            task_results: std::mem::take(&mut self.completed),
            layers_completed: self.layers_completed,
            last_checkpoint_id: self.last_checkpoint,
        }));
    }
}

enum Escalation {
    Retry(Dispatch),
    Declined,
    Stop(Termination),
}

fn skipped_result(task: &Task, summary: ResultSummary) -> TaskResult {
    TaskResult {
        task_id: task.id.clone(),
        summary,
        output: None,
    }
}
