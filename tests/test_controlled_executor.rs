//! Scenario tests for the controlled executor
//!
//! A scripted task executor decides each task's outcome from its id, and
//! the tests steer runs through the command queue while watching the event
//! stream.

use async_trait::async_trait;
use dagger_gate::coord::{Command, DecisionRequest, GateKind};
use dagger_gate::dag_flow::{
    ControlledExecutor, Dag, EventSubscriber, ExecutionEvent, ExecutionOptions, ExecutionUpdate,
    LayerResult, StaticSuggester, Task, TaskContext, TaskExecutor, TaskOutput, TerminalResult,
    TerminalStatus,
};
use dagger_gate::learning::ExecutionMode;
use dagger_gate::security::PermissionLevel;
use dagger_gate::storage::{
    Checkpoint, CheckpointStore, EscalationAuditLog, MemoryCheckpointStore, ResultSummary,
    TaskStatus,
};
use dagger_gate::{ControlError, ExecutorConfig};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Outcome chosen by task id prefix:
/// - `fail*` fails
/// - `net*` needs network access
/// - `stubborn*` reports a network denial at every level
/// - `shell*` needs process execution
/// - `slow*` sleeps before succeeding
#[derive(Default)]
struct Scripted {
    runs: Mutex<Vec<(String, u32, PermissionLevel)>>,
}

impl Scripted {
    fn runs_of(&self, task_id: &str) -> Vec<(u32, PermissionLevel)> {
        self.runs
            .lock()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, attempt, level)| (*attempt, *level))
            .collect()
    }

    fn ran(&self) -> Vec<String> {
        self.runs.lock().iter().map(|(id, _, _)| id.clone()).collect()
    }
}

#[async_trait]
impl TaskExecutor for Scripted {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<TaskOutput> {
        self.runs
            .lock()
            .push((task.id.clone(), ctx.attempt, ctx.permission_level));

        let id = task.id.as_str();
        if id.starts_with("fail") {
            return Ok(TaskOutput::failure("boom"));
        }
        if id.starts_with("net") && ctx.permission_level < PermissionLevel::Network {
            anyhow::bail!("PermissionDenied: Requires net access to \"api.example.com\"");
        }
        if id.starts_with("stubborn") {
            return Ok(TaskOutput::failure(
                "PermissionDenied: Requires net access to \"api.example.com\"",
            ));
        }
        if id.starts_with("shell") {
            return Ok(TaskOutput::failure(
                "PermissionDenied: Requires run access to \"bash\"",
            ));
        }
        if id.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(TaskOutput::success(json!({ "task": id, "deps": ctx.dependency_results.len() })))
    }
}

struct Harness {
    executor: ControlledExecutor,
    tasks: Arc<Scripted>,
    store: Arc<MemoryCheckpointStore>,
}

fn harness_with(config: ExecutorConfig) -> Harness {
    dagger_gate::core::logging::init_test_tracing();
    let tasks = Arc::new(Scripted::default());
    let store = Arc::new(MemoryCheckpointStore::new(&config.checkpoint));
    let executor = ControlledExecutor::new(config, tasks.clone())
        .unwrap()
        .with_checkpoint_store(store.clone());
    Harness {
        executor,
        tasks,
        store,
    }
}

fn harness() -> Harness {
    harness_with(ExecutorConfig::default())
}

fn chain() -> Dag {
    Dag::from_tasks(
        "chain",
        vec![
            Task::action("a", "step"),
            Task::action("b", "step").with_dep("a"),
            Task::action("c", "step").with_dep("b"),
        ],
    )
    .unwrap()
}

async fn next_decision(events: &mut EventSubscriber) -> DecisionRequest {
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("decision in time")
            .expect("event stream open");
        if let ExecutionEvent::DecisionRequired { request } = envelope.event {
            return request;
        }
    }
}

async fn next_layer(handle: &mut dagger_gate::ExecutionHandle) -> LayerResult {
    match tokio::time::timeout(Duration::from_secs(5), handle.next()).await {
        Ok(Some(ExecutionUpdate::Layer(layer))) => layer,
        other => panic!("expected a layer result, got {:?}", other),
    }
}

async fn terminal(handle: dagger_gate::ExecutionHandle) -> TerminalResult {
    tokio::time::timeout(Duration::from_secs(10), handle.wait_terminal())
        .await
        .expect("terminal in time")
        .unwrap()
}

#[tokio::test]
async fn test_per_layer_validation_continue_then_abort() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let mut handle = h
        .executor
        .execute(
            chain(),
            ExecutionOptions::new()
                .with_workflow_id("wf-3")
                .per_layer_validation(true),
        )
        .await
        .unwrap();

    let layer0 = next_layer(&mut handle).await;
    assert_eq!(layer0.layer_index, 0);
    assert!(layer0.task("a").unwrap().summary.is_success());
    assert!(h.store.load(layer0.checkpoint_id).await.is_ok());

    let gate = next_decision(&mut events).await;
    assert_eq!(gate.kind, GateKind::LayerValidation);
    assert_eq!(gate.layer_index, 1);
    assert_eq!(gate.pending_tasks[0].task_id, "b");
    h.executor.enqueue(Command::continue_("wf-3")).unwrap();

    let layer1 = next_layer(&mut handle).await;
    assert_eq!(layer1.layer_index, 1);
    assert!(layer1.checkpoint_id > layer0.checkpoint_id);
    // Superseded by the newer checkpoint
    assert!(h.store.load(layer0.checkpoint_id).await.is_err());

    let gate = next_decision(&mut events).await;
    assert_eq!(gate.layer_index, 2);
    h.executor
        .enqueue(Command::abort("wf-3", "operator stop"))
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Aborted);
    assert_eq!(result.reason, "operator stop");
    assert_eq!(result.layers_completed, 2);
    assert!(result.task_results.get("c").is_none());
    assert!(h.store.load(layer1.checkpoint_id).await.is_err());
    assert!(h.store.is_empty());
    assert_eq!(h.tasks.ran(), vec!["a", "b"]);

    let late = h.executor.enqueue(Command::continue_("wf-3")).unwrap_err();
    assert!(matches!(late, ControlError::UnknownWorkflow { .. }));
    assert_eq!(
        h.executor.workflow_state("wf-3"),
        Some(dagger_gate::ExecutionState::Aborted)
    );
}

#[tokio::test]
async fn test_unvalidated_run_completes_and_deletes_checkpoint() {
    let h = harness();
    let handle = h
        .executor
        .execute(chain(), ExecutionOptions::new())
        .await
        .unwrap();
    let result = terminal(handle).await;

    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.reason, "All 3 layers completed");
    assert_eq!(result.layers_completed, 3);
    assert_eq!(result.task_results.len(), 3);
    assert!(result.last_checkpoint_id.is_none());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_mid_confidence_task_raises_suggestion_gate() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks(
        "suggest",
        vec![
            Task::action("maybe", "step").with_confidence(0.55),
            Task::action("sure", "step").with_confidence(0.95),
        ],
    )
    .unwrap();

    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-s"))
        .await
        .unwrap();

    let gate = next_decision(&mut events).await;
    assert_eq!(gate.kind, GateKind::Suggestion);
    assert_eq!(gate.pending_tasks.len(), 1);
    assert_eq!(gate.pending_tasks[0].task_id, "maybe");
    assert_eq!(gate.pending_tasks[0].confidence, Some(0.55));
    assert_eq!(gate.pending_tasks[0].mode, Some(ExecutionMode::Suggestion));

    // Continue is not an answer to a task gate
    assert!(h.executor.enqueue(Command::continue_("wf-s")).is_err());
    h.executor
        .enqueue(Command::approve("wf-s", Some("reviewer".into())))
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(
        result.task_results["maybe"].mode,
        Some(ExecutionMode::Suggestion)
    );
    assert_eq!(
        result.task_results["sure"].mode,
        Some(ExecutionMode::Speculative)
    );
    assert_eq!(h.executor.thresholds().metrics().total_recorded, 2);
}

#[tokio::test]
async fn test_rejected_task_prunes_dependents_only() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks(
        "reject",
        vec![
            Task::action("guess", "step").with_confidence(0.45),
            Task::action("free", "step"),
            Task::action("child", "step").with_dep("guess"),
            Task::action("sibling", "step").with_dep("free"),
        ],
    )
    .unwrap();

    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-r"))
        .await
        .unwrap();

    let gate = next_decision(&mut events).await;
    assert_eq!(gate.pending_tasks[0].mode, Some(ExecutionMode::Explicit));
    h.executor
        .enqueue(Command::reject("wf-r", "not this one"))
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.status_of("guess"), Some(TaskStatus::Rejected));
    assert_eq!(
        result.task_results["guess"].error.as_deref(),
        Some("not this one")
    );
    assert_eq!(result.status_of("child"), Some(TaskStatus::Skipped));
    assert_eq!(result.status_of("free"), Some(TaskStatus::Succeeded));
    assert_eq!(result.status_of("sibling"), Some(TaskStatus::Succeeded));
    assert!(result.reason.contains("2 tasks did not succeed"));
    assert!(!h.tasks.ran().contains(&"guess".to_string()));
}

#[tokio::test]
async fn test_failed_task_prunes_dependents_and_keeps_siblings() {
    let h = harness();
    let dag = Dag::from_tasks(
        "failing",
        vec![
            Task::action("fail-1", "step"),
            Task::action("ok-1", "step"),
            Task::action("after-fail", "step").with_dep("fail-1"),
            Task::action("after-ok", "step").with_dep("ok-1"),
        ],
    )
    .unwrap();

    let result = terminal(h.executor.execute(dag, ExecutionOptions::new()).await.unwrap()).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.status_of("fail-1"), Some(TaskStatus::Failed));
    assert_eq!(result.status_of("after-fail"), Some(TaskStatus::Skipped));
    assert_eq!(result.status_of("after-ok"), Some(TaskStatus::Succeeded));
    assert!(!h.tasks.ran().contains(&"after-fail".to_string()));
}

#[tokio::test]
async fn test_event_order_is_topological() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks(
        "diamond",
        vec![
            Task::action("root", "step"),
            Task::action("left", "step").with_dep("root"),
            Task::action("right", "step").with_dep("root"),
            Task::action("join", "step").with_deps(["left", "right"]),
        ],
    )
    .unwrap();
    let deps: HashMap<String, Vec<String>> = dag
        .tasks()
        .map(|t| (t.id.clone(), t.depends_on.clone()))
        .collect();

    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-topo"))
        .await
        .unwrap();
    let observed = events.collect_workflow("wf-topo").await;
    assert_eq!(terminal(handle).await.status, TerminalStatus::Complete);

    let mut finished: HashMap<String, u64> = HashMap::new();
    let mut layers = Vec::new();
    for envelope in &observed {
        match &envelope.event {
            ExecutionEvent::TaskStarted { task_id, .. } => {
                for dep in &deps[task_id] {
                    assert!(
                        finished.contains_key(dep),
                        "{} started before {} finished",
                        task_id,
                        dep
                    );
                }
            }
            ExecutionEvent::TaskComplete { task_id, .. } => {
                finished.insert(task_id.clone(), envelope.sequence);
            }
            ExecutionEvent::LayerStarted { layer_index, .. } => layers.push(*layer_index),
            _ => {}
        }
    }
    assert_eq!(layers, vec![0, 1, 2]);
    assert_eq!(finished.len(), 4);
    assert_eq!(observed.last().unwrap().event.kind(), "workflow_complete");
}

#[tokio::test]
async fn test_resume_does_not_rerun_completed_tasks() {
    let h = harness();
    let done = ResultSummary::from_output(
        &TaskOutput::success(json!("a")),
        None,
        1,
        PermissionLevel::Minimal,
    );
    let mut completed = BTreeMap::new();
    completed.insert("a".to_string(), done);
    let checkpoint_id = h
        .store
        .save(Checkpoint::new("wf-resume", 0, completed))
        .await
        .unwrap();

    let handle = h
        .executor
        .resume(chain(), checkpoint_id, ExecutionOptions::new())
        .await
        .unwrap();
    assert_eq!(handle.workflow_id(), "wf-resume");

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(h.tasks.ran(), vec!["b", "c"]);
    assert_eq!(result.task_results.len(), 3);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_resume_with_missing_dependency_fails() {
    let h = harness();
    let checkpoint_id = h
        .store
        .save(Checkpoint::new("wf-bad", 0, BTreeMap::new()))
        .await
        .unwrap();

    let handle = h
        .executor
        .resume(chain(), checkpoint_id, ExecutionOptions::new())
        .await
        .unwrap();
    let result = terminal(handle).await;

    assert_eq!(result.status, TerminalStatus::Failed);
    assert!(result.reason.contains("does not match"), "{}", result.reason);
    assert!(result.reason.contains("'a'"));
    assert!(h.tasks.ran().is_empty());
    // Kept for inspection
    assert!(h.store.load(checkpoint_id).await.is_ok());
}

#[tokio::test]
async fn test_resume_from_unknown_checkpoint_is_rejected() {
    let h = harness();
    let err = h
        .executor
        .resume(chain(), 999, ExecutionOptions::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ControlError::CheckpointNotFound { checkpoint_id: 999 }));
}

#[tokio::test]
async fn test_approved_escalation_retries_exactly_once() {
    let h = harness();
    let audit = Arc::new(EscalationAuditLog::temporary().unwrap());
    let executor = h.executor.clone().with_audit_log(audit.clone());
    let mut events = executor.subscribe();

    let dag = Dag::from_tasks(
        "escalate",
        vec![
            Task::capability("net-fetch", "http:get").with_permission(PermissionLevel::Readonly),
            Task::capability("stubborn-fetch", "http:get")
                .with_permission(PermissionLevel::Readonly),
        ],
    )
    .unwrap();
    let handle = executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-esc"))
        .await
        .unwrap();

    for _ in 0..2 {
        let gate = next_decision(&mut events).await;
        assert_eq!(gate.kind, GateKind::Escalation);
        let escalation = gate.escalation.unwrap();
        assert_eq!(escalation.current_level, PermissionLevel::Readonly);
        assert_eq!(escalation.requested_level, PermissionLevel::Network);
        executor
            .enqueue(Command::approve("wf-esc", Some("alice".into())))
            .unwrap();
    }

    let result = terminal(handle).await;
    let fetched = &result.task_results["net-fetch"];
    assert_eq!(fetched.status, TaskStatus::Succeeded);
    assert_eq!(fetched.attempts, 2);
    assert!(fetched.escalated);
    assert_eq!(fetched.permission_level, PermissionLevel::Network);

    // Still denied after the retry: no second gate, no third run
    assert_eq!(result.status_of("stubborn-fetch"), Some(TaskStatus::Failed));
    assert_eq!(
        h.tasks.runs_of("stubborn-fetch"),
        vec![
            (1, PermissionLevel::Readonly),
            (2, PermissionLevel::Network)
        ]
    );

    let entries = audit.for_workflow("wf-esc").unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.approved));
    assert_eq!(entries[0].approved_by.as_deref(), Some("alice"));
    assert_eq!(entries[0].capability_id, "http:get");
}

#[tokio::test]
async fn test_rejected_escalation_leaves_task_failed() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks("esc", vec![Task::capability("net-call", "http:get")]).unwrap();
    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-no"))
        .await
        .unwrap();

    next_decision(&mut events).await;
    h.executor
        .enqueue(Command::reject("wf-no", "not allowed"))
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status_of("net-call"), Some(TaskStatus::Failed));
    assert_eq!(h.tasks.runs_of("net-call").len(), 1);
}

#[tokio::test]
async fn test_security_critical_denial_is_never_escalated() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks("shell", vec![Task::capability("shell-out", "exec")]).unwrap();
    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-sh"))
        .await
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.status_of("shell-out"), Some(TaskStatus::Failed));
    assert_eq!(h.tasks.runs_of("shell-out").len(), 1);

    let kinds: Vec<&str> = events
        .drain()
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert!(!kinds.contains(&"decision_required"));
    assert!(!kinds.contains(&"escalation_requested"));
}

#[tokio::test]
async fn test_replan_splices_tasks_and_failed_replan_regates() {
    let suggester = StaticSuggester::new().with_replan(
        "add a report",
        vec![vec![Task::action("report", "step").with_dep("a")]],
    );
    let h = harness();
    let executor = h.executor.clone().with_suggester(Arc::new(suggester));
    let mut events = executor.subscribe();

    let dag = Dag::from_tasks(
        "replan",
        vec![
            Task::action("a", "step"),
            Task::action("b", "step").with_dep("a"),
        ],
    )
    .unwrap();
    let mut handle = executor
        .execute(
            dag,
            ExecutionOptions::new()
                .with_workflow_id("wf-plan")
                .per_layer_validation(true),
        )
        .await
        .unwrap();
    next_layer(&mut handle).await;

    let first = next_decision(&mut events).await;
    executor
        .enqueue(Command::replan("wf-plan", "something impossible"))
        .unwrap();
    let second = next_decision(&mut events).await;
    assert_ne!(first.gate_id, second.gate_id);
    assert_eq!(second.layer_index, 1);
    executor
        .enqueue(Command::replan("wf-plan", "add a report"))
        .unwrap();

    let layer1 = next_layer(&mut handle).await;
    assert!(layer1.task("b").is_some());
    assert!(layer1.task("report").unwrap().summary.is_success());

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.task_results.len(), 3);
}

#[tokio::test]
async fn test_gate_timeout_aborts_with_reason() {
    let config = ExecutorConfig {
        gate_timeout_secs: 1,
        ..ExecutorConfig::default()
    };
    let h = harness_with(config);
    let handle = h
        .executor
        .execute(chain(), ExecutionOptions::new().per_layer_validation(true))
        .await
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Aborted);
    assert_eq!(result.reason, "timeout");
    assert_eq!(result.layers_completed, 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_protocol_violations_leave_workflow_untouched() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let handle = h
        .executor
        .execute(
            chain(),
            ExecutionOptions::new()
                .with_workflow_id("wf-p")
                .gate_before_layer(0),
        )
        .await
        .unwrap();
    next_decision(&mut events).await;

    let dup = h
        .executor
        .execute(chain(), ExecutionOptions::new().with_workflow_id("wf-p"))
        .await
        .err()
        .unwrap();
    assert!(matches!(dup, ControlError::WorkflowAlreadyRunning { .. }));

    let unknown = h.executor.enqueue(Command::continue_("nobody")).unwrap_err();
    assert!(unknown.is_protocol_violation());

    // The open gate still takes its answer
    h.executor.enqueue(Command::continue_("wf-p")).unwrap();
    let twice = h.executor.enqueue(Command::continue_("wf-p")).unwrap_err();
    assert!(matches!(twice, ControlError::OutOfSequence { .. }));

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(h.tasks.ran(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_abort_is_honored_at_layer_boundary() {
    let h = harness();
    let dag = Dag::from_tasks(
        "slow",
        vec![
            Task::action("slow-1", "step"),
            Task::action("slow-2", "step").with_dep("slow-1"),
            Task::action("slow-3", "step").with_dep("slow-2"),
        ],
    )
    .unwrap();
    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-stop"))
        .await
        .unwrap();
    h.executor
        .enqueue(Command::abort("wf-stop", "operator"))
        .unwrap();

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Aborted);
    assert_eq!(result.reason, "operator");
    assert!(result.layers_completed < 3);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_execute_intent_uses_suggester() {
    let dag = Dag::from_tasks("planned", vec![Task::action("only", "step")]).unwrap();
    let h = harness();
    let executor = h
        .executor
        .clone()
        .with_suggester(Arc::new(StaticSuggester::new().with_dag("do it", dag)));

    let result = terminal(
        executor
            .execute_intent("do it", ExecutionOptions::new())
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.status_of("only"), Some(TaskStatus::Succeeded));

    let err = executor
        .execute_intent("unknown", ExecutionOptions::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ControlError::Suggester(_)));
}

#[tokio::test]
async fn test_concurrent_workflows_are_independent() {
    let h = harness();
    let mut events = h.executor.subscribe();

    let gated = h
        .executor
        .execute(
            chain(),
            ExecutionOptions::new()
                .with_workflow_id("wf-gated")
                .gate_before_layer(0),
        )
        .await
        .unwrap();
    let free = h
        .executor
        .execute(chain(), ExecutionOptions::new().with_workflow_id("wf-free"))
        .await
        .unwrap();

    // One workflow waiting at a gate does not hold up the other
    assert_eq!(terminal(free).await.status, TerminalStatus::Complete);
    assert_eq!(next_decision(&mut events).await.workflow_id, "wf-gated");
    h.executor.enqueue(Command::continue_("wf-gated")).unwrap();
    assert_eq!(terminal(gated).await.status, TerminalStatus::Complete);
}

#[tokio::test]
async fn test_resume_with_unsettled_earlier_task_fails() {
    let h = harness();
    let dag = Dag::from_layers(
        "gappy",
        vec![
            vec![Task::action("a", "step"), Task::action("x", "step")],
            vec![Task::action("b", "step").with_dep("a")],
            vec![
                Task::action("c", "step").with_dep("b"),
                Task::action("y", "step").with_dep("x"),
            ],
        ],
    )
    .unwrap();

    let mut completed = BTreeMap::new();
    completed.insert(
        "a".to_string(),
        ResultSummary::from_output(
            &TaskOutput::success(json!("a")),
            None,
            1,
            PermissionLevel::Minimal,
        ),
    );
    let checkpoint_id = h
        .store
        .save(Checkpoint::new("wf-gap", 0, completed))
        .await
        .unwrap();

    let result = terminal(
        h.executor
            .resume(dag, checkpoint_id, ExecutionOptions::new())
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(result.status, TerminalStatus::Failed);
    assert!(result.reason.contains("'x'"), "{}", result.reason);
    assert!(result.task_results.get("y").is_none());
    assert!(h.tasks.ran().is_empty());
    assert!(h.store.load(checkpoint_id).await.is_ok());
}

#[tokio::test]
async fn test_risky_tasks_are_gated_individually() {
    let h = harness();
    let mut events = h.executor.subscribe();
    let dag = Dag::from_tasks(
        "risky",
        vec![
            Task::action("deploy", "step").risky(),
            Task::action("drop-table", "step").risky(),
            Task::action("notify", "step").with_dep("deploy"),
            Task::action("vacuum", "step").with_dep("drop-table"),
        ],
    )
    .unwrap();

    let handle = h
        .executor
        .execute(dag, ExecutionOptions::new().with_workflow_id("wf-risky"))
        .await
        .unwrap();

    for _ in 0..2 {
        let gate = next_decision(&mut events).await;
        assert_eq!(gate.kind, GateKind::RiskyTask);
        assert_eq!(gate.layer_index, 0);
        assert_eq!(gate.pending_tasks.len(), 1);
        assert!(h.executor.enqueue(Command::continue_("wf-risky")).is_err());

        let command = match gate.pending_tasks[0].task_id.as_str() {
            "deploy" => Command::approve("wf-risky", Some("ops".into())),
            "drop-table" => Command::reject("wf-risky", "keep the data"),
            other => panic!("unexpected gate for {}", other),
        };
        h.executor.enqueue(command).unwrap();
    }

    let result = terminal(handle).await;
    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.status_of("deploy"), Some(TaskStatus::Succeeded));
    assert_eq!(result.status_of("notify"), Some(TaskStatus::Succeeded));
    assert_eq!(result.status_of("drop-table"), Some(TaskStatus::Rejected));
    assert_eq!(result.status_of("vacuum"), Some(TaskStatus::Skipped));
    assert!(!h.tasks.ran().contains(&"drop-table".to_string()));
    assert!(!h.tasks.ran().contains(&"vacuum".to_string()));
}

#[tokio::test]
async fn test_resume_after_replan_keeps_spliced_tasks() {
    let suggester = StaticSuggester::new().with_replan(
        "add a report",
        vec![vec![Task::action("report", "step").with_dep("a")]],
    );
    let h = harness();
    let executor = h.executor.clone().with_suggester(Arc::new(suggester));
    let mut events = executor.subscribe();

    let mut handle = executor
        .execute(
            chain(),
            ExecutionOptions::new()
                .with_workflow_id("wf-replay")
                .per_layer_validation(true),
        )
        .await
        .unwrap();
    next_layer(&mut handle).await;

    next_decision(&mut events).await;
    executor
        .enqueue(Command::replan("wf-replay", "add a report"))
        .unwrap();
    let layer1 = next_layer(&mut handle).await;
    assert!(layer1.task("report").unwrap().summary.is_success());

    // Copy the layer 1 checkpoint before the abort removes it
    next_decision(&mut events).await;
    let saved = h.store.load(layer1.checkpoint_id).await.unwrap();
    assert_eq!(saved.replanned_tasks.len(), 1);
    assert_eq!(saved.replanned_tasks[0].id, "report");
    executor
        .enqueue(Command::abort("wf-replay", "restart later"))
        .unwrap();
    assert_eq!(terminal(handle).await.status, TerminalStatus::Aborted);

    let checkpoint_id = h.store.save(saved).await.unwrap();
    let result = terminal(
        executor
            .resume(chain(), checkpoint_id, ExecutionOptions::new())
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(result.status, TerminalStatus::Complete);
    assert_eq!(result.task_results.len(), 4);
    assert_eq!(result.status_of("report"), Some(TaskStatus::Succeeded));
    assert_eq!(result.status_of("c"), Some(TaskStatus::Succeeded));
    let mut ran = h.tasks.ran();
    ran.sort();
    assert_eq!(ran, vec!["a", "b", "c", "report"]);
}

#[tokio::test]
async fn test_finished_workflow_state_can_be_forgotten() {
    let h = harness();
    let mut events = h.executor.subscribe();

    let done = terminal(
        h.executor
            .execute(chain(), ExecutionOptions::new().with_workflow_id("wf-done"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(done.status, TerminalStatus::Complete);

    let handle = h
        .executor
        .execute(
            chain(),
            ExecutionOptions::new()
                .with_workflow_id("wf-live")
                .per_layer_validation(true),
        )
        .await
        .unwrap();
    next_decision(&mut events).await;

    assert_eq!(h.executor.forget("wf-live"), None);
    assert_eq!(
        h.executor.workflow_state("wf-live"),
        Some(dagger_gate::ExecutionState::GateWaiting)
    );
    assert_eq!(
        h.executor.forget("wf-done"),
        Some(dagger_gate::ExecutionState::Complete)
    );
    assert_eq!(h.executor.workflow_state("wf-done"), None);

    h.executor
        .enqueue(Command::abort("wf-live", "done here"))
        .unwrap();
    terminal(handle).await;
    assert_eq!(h.executor.forget_finished(), 1);
    assert_eq!(h.executor.workflow_state("wf-live"), None);
}

#[tokio::test]
async fn test_executor_janitor_uses_configured_interval() {
    let mut config = ExecutorConfig::default();
    config.checkpoint.ttl_secs = 1;
    config.checkpoint.cleanup_interval_secs = 1;
    let h = harness_with(config);

    let stale = h
        .store
        .save(Checkpoint::new("wf-old", 0, BTreeMap::new()))
        .await
        .unwrap();
    let janitor = h.executor.start_checkpoint_janitor();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    janitor.abort();

    assert!(h.store.load(stale).await.is_err());
    assert!(h.store.is_empty());
}
