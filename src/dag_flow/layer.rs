//! Bounded-parallel dispatch of one batch of tasks
//!
//! Every task runs on its own tokio task behind a semaphore permit, so a
//! blocking task only holds up its own unit. The batch is a join: it
//! returns once every task has settled, in the order tasks were given.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::action::{TaskContext, TaskExecutor, TaskOutput};
use super::dag::Task;
use super::events::{EventStream, ExecutionEvent};
use crate::learning::ExecutionMode;

/// A task cleared to run
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub task: Task,
    pub ctx: TaskContext,
    pub mode: Option<ExecutionMode>,
    /// Approved at a decision gate
    pub user_accepted: Option<bool>,
}

/// A dispatched task together with its outcome
#[derive(Debug, Clone)]
pub(crate) struct Settled {
    pub dispatch: Dispatch,
    pub output: TaskOutput,
}

pub(crate) struct LayerRunner {
    workflow_id: String,
    executor: Arc<dyn TaskExecutor>,
    permits: Arc<Semaphore>,
    task_timeout: Option<Duration>,
    events: EventStream,
}

impl LayerRunner {
    pub fn new(
        workflow_id: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
        max_parallelism: usize,
        task_timeout: Option<Duration>,
        events: EventStream,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            executor,
            permits: Arc::new(Semaphore::new(max_parallelism.max(1))),
            task_timeout,
            events,
        }
    }

    pub async fn run_batch(&self, batch: Vec<Dispatch>) -> Vec<Settled> {
        let mut pending = FuturesUnordered::new();

        for (position, dispatch) in batch.iter().enumerate() {
            self.events.emit(
                &self.workflow_id,
                ExecutionEvent::TaskStarted {
                    layer_index: dispatch.ctx.layer_index,
                    task_id: dispatch.task.id.clone(),
                    mode: dispatch.mode,
                    attempt: dispatch.ctx.attempt,
                    permission_level: dispatch.ctx.permission_level,
                },
            );

            let executor = Arc::clone(&self.executor);
            let permits = Arc::clone(&self.permits);
            let task = dispatch.task.clone();
            let ctx = dispatch.ctx.clone();
            let timeout = self.task_timeout;

            let handle = tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutput::failure("Dispatcher shut down"),
                };
                run_one(executor.as_ref(), &task, &ctx, timeout).await
            });
            pending.push(async move { (position, handle.await) });
        }

        let mut outputs: Vec<Option<TaskOutput>> = vec![None; batch.len()];
        while let Some((position, joined)) = pending.next().await {
            let output = match joined {
                Ok(output) => output,
                Err(e) => {
                    warn!(task_id = %batch[position].task.id, "Task panicked: {}", e);
                    TaskOutput::failure(format!("Task panicked: {}", e))
                }
            };

            if !output.success {
                let dispatch = &batch[position];
                self.events.emit(
                    &self.workflow_id,
                    ExecutionEvent::TaskFailed {
                        layer_index: dispatch.ctx.layer_index,
                        task_id: dispatch.task.id.clone(),
                        attempt: dispatch.ctx.attempt,
                        error: output.error.clone().unwrap_or_default(),
                    },
                );
            }
            outputs[position] = Some(output);
        }

        batch
            .into_iter()
            .zip(outputs)
            .map(|(dispatch, output)| Settled {
                output: output
                    .unwrap_or_else(|| TaskOutput::failure("Task produced no result")),
                dispatch,
            })
            .collect()
    }
}

async fn run_one(
    executor: &dyn TaskExecutor,
    task: &Task,
    ctx: &TaskContext,
    timeout: Option<Duration>,
) -> TaskOutput {
    let start = Instant::now();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.run(task, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "Task timed out after {}ms",
                limit.as_millis()
            )),
        },
        None => executor.run(task, ctx).await,
    };
    let elapsed = start.elapsed().as_millis() as u64;
    debug!(task_id = %task.id, attempt = ctx.attempt, elapsed_ms = elapsed, "Task settled");

    match result {
        Ok(output) if output.duration_ms == 0 => output.with_duration(elapsed),
        Ok(output) => output,
        Err(e) => TaskOutput::failure(e.to_string()).with_duration(elapsed),
    }
}
