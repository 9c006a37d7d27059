use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::core::types::{GraphId, GroupId, RunId, TaskId};

/// Report handed to a [`FailureObserver`] when a run ends `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub graph_id: GraphId,
    pub run_id: RunId,
    pub failing_group: GroupId,
    pub failing_task: TaskId,
    pub attempts: u32,
    pub error: String,
    /// Reference into run history, `history://{run_id}/{group}.{task}`.
    pub diagnostic: String,
}

impl RunFailure {
    pub fn diagnostic_ref(run_id: &RunId, group: &GroupId, task: &TaskId) -> String {
        format!("history://{}/{}.{}", run_id, group, task)
    }
}

/// Receives one notification per run that transitions into `Failed`.
///
/// Purely observational: whatever the observer does (including panicking),
/// the run's outcome is already decided and the call is never retried.
#[async_trait]
pub trait FailureObserver: Send + Sync {
    async fn on_failure(&self, failure: &RunFailure);
}

/// Logs failures at error level.
pub struct LoggingFailureObserver;

#[async_trait]
impl FailureObserver for LoggingFailureObserver {
    async fn on_failure(&self, failure: &RunFailure) {
        error!(
            graph = %failure.graph_id,
            run_id = %failure.run_id,
            group = %failure.failing_group,
            task = %failure.failing_task,
            attempts = failure.attempts,
            diagnostic = %failure.diagnostic,
            "run failed: {}",
            failure.error
        );
    }
}
