//! Task execution engine.
//!
//! The `TaskExecutor` runs one task node to a terminal outcome:
//! - each attempt holds a permit of the graph's concurrency pool
//! - each attempt is bounded by the node's timeout
//! - failures are retried per the node's retry policy, with a fixed backoff
//!   spent outside the pool
//! - outputs are merged into the run's store only after a successful attempt

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::core::context::{ContextStore, TaskContext};
use crate::core::group::TaskNode;
use crate::core::task::TaskError;
use crate::core::types::{GraphId, RunId, TaskRef};
use crate::events::{Event, EventBus};

/// Result of executing a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// The task that was executed.
    pub task: TaskRef,
    /// Whether the task succeeded.
    pub success: bool,
    /// Number of attempts made (1 = first try, 2+ = retries).
    pub attempts: u32,
    /// Total duration of all attempts, backoff included.
    pub duration: Duration,
    /// Error of the last attempt if the task failed.
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(task: TaskRef, attempts: u32, duration: Duration) -> Self {
        Self {
            task,
            success: true,
            attempts,
            duration,
            error: None,
        }
    }

    pub fn failure(task: TaskRef, attempts: u32, duration: Duration, error: String) -> Self {
        Self {
            task,
            success: false,
            attempts,
            duration,
            error: Some(error),
        }
    }
}

/// Everything one task invocation needs from its run.
#[derive(Clone)]
pub struct Invocation {
    pub graph_id: GraphId,
    pub run_id: RunId,
    pub task: TaskRef,
    /// Declared upstream outputs only.
    pub inputs: ContextStore,
    pub config: Arc<HashMap<String, Value>>,
}

/// Executor for running tasks with concurrency control and retry logic.
pub struct TaskExecutor {
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl TaskExecutor {
    /// Create a new executor with the given concurrency limit.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Get the number of available permits (slots for concurrent execution).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `node` until it succeeds or its retry policy gives up.
    ///
    /// Emits `TaskStarted` per attempt, `TaskRetrying` per retry and one
    /// terminal `TaskSucceeded` / `TaskFailed`. On success the attempt's
    /// outputs are merged into `store`.
    pub async fn execute(
        &self,
        node: &TaskNode,
        invocation: Invocation,
        store: &ContextStore,
        events: &EventBus,
    ) -> TaskResult {
        let Invocation {
            graph_id,
            run_id,
            task,
            inputs,
            config,
        } = invocation;
        let start_time = Instant::now();
        let total_attempts = node.retry.total_attempts();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let outcome = {
                let _permit = match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return TaskResult::failure(
                            task,
                            attempts - 1,
                            start_time.elapsed(),
                            "executor closed".to_string(),
                        );
                    }
                };

                events
                    .emit(Event::task_started(
                        graph_id.clone(),
                        run_id,
                        task.clone(),
                        attempts,
                    ))
                    .await;
                debug!(task = %task, attempt = attempts, "attempt started");

                // A fresh buffer per attempt: a failed attempt leaves no outputs.
                let mut ctx = TaskContext::new(run_id, inputs.clone(), task.clone(), config.clone());
                let result = match node.timeout {
                    Some(limit) => match timeout(limit, node.task.execute(&mut ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(TaskError::Timeout(limit)),
                    },
                    None => node.task.execute(&mut ctx).await,
                };
                result.and_then(|()| store.merge(ctx.outputs).map_err(TaskError::from))
            };

            match outcome {
                Ok(()) => {
                    let duration = start_time.elapsed();
                    events
                        .emit(Event::task_succeeded(
                            graph_id.clone(),
                            run_id,
                            task.clone(),
                            attempts,
                            duration,
                        ))
                        .await;
                    return TaskResult::success(task, attempts, duration);
                }
                Err(err) if node.retry.should_retry(attempts, &err) => {
                    warn!(
                        task = %task,
                        attempt = attempts,
                        max_attempts = total_attempts,
                        backoff_secs = node.retry.backoff.as_secs_f64(),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    events
                        .emit(Event::task_retrying(
                            graph_id.clone(),
                            run_id,
                            task.clone(),
                            attempts,
                            total_attempts,
                            err.to_string(),
                        ))
                        .await;
                    sleep(node.retry.backoff).await;
                }
                Err(err) => {
                    warn!(task = %task, attempts, error = %err, "task failed");
                    events
                        .emit(Event::task_failed(
                            graph_id.clone(),
                            run_id,
                            task.clone(),
                            attempts,
                            err.to_string(),
                        ))
                        .await;
                    return TaskResult::failure(task, attempts, start_time.elapsed(), err.to_string());
                }
            }
        }
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(crate::core::graph::DEFAULT_MAX_CONCURRENT_TASKS)
    }
}
