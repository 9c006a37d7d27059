use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{HistoryRecord, Storage};
use crate::core::types::TaskStatus;
use crate::events::{Event, EventHandler};

/// Event handler that appends run history.
///
/// A failed write is logged and dropped; history never fails a run.
pub struct HistoryRecorder {
    storage: Arc<dyn Storage>,
}

impl HistoryRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn to_record(event: &Event) -> Option<HistoryRecord> {
        let record = match event {
            Event::RunStarted {
                graph_id,
                run_id,
                timestamp,
            } => HistoryRecord::RunStarted {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                at: *timestamp,
            },
            Event::TaskSucceeded {
                graph_id,
                run_id,
                task,
                attempts,
                timestamp,
                ..
            } => HistoryRecord::TaskFinished {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                task: task.clone(),
                status: TaskStatus::Succeeded,
                attempts: *attempts,
                error: None,
                at: *timestamp,
            },
            Event::TaskFailed {
                graph_id,
                run_id,
                task,
                attempts,
                error,
                timestamp,
            } => HistoryRecord::TaskFinished {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                task: task.clone(),
                status: TaskStatus::Failed,
                attempts: *attempts,
                error: Some(error.clone()),
                at: *timestamp,
            },
            Event::TaskSkipped {
                graph_id,
                run_id,
                task,
                timestamp,
            } => HistoryRecord::TaskFinished {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                task: task.clone(),
                status: TaskStatus::Skipped,
                attempts: 0,
                error: None,
                at: *timestamp,
            },
            Event::GroupFinished {
                graph_id,
                run_id,
                group,
                status,
                timestamp,
            } => HistoryRecord::GroupFinished {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                group: group.clone(),
                status: *status,
                at: *timestamp,
            },
            Event::RunFinished {
                graph_id,
                run_id,
                status,
                timestamp,
                ..
            } => HistoryRecord::RunFinished {
                graph_id: graph_id.clone(),
                run_id: *run_id,
                status: *status,
                at: *timestamp,
            },
            Event::GroupStarted { .. } | Event::TaskStarted { .. } | Event::TaskRetrying { .. } => {
                return None;
            }
        };
        Some(record)
    }
}

#[async_trait]
impl EventHandler for HistoryRecorder {
    async fn handle(&self, event: &Event) {
        if let Some(record) = Self::to_record(event) {
            let kind = record.kind();
            if let Err(e) = self.storage.append(record).await {
                warn!(run_id = %event.run_id(), kind, error = %e, "failed to append run history");
            }
        }
    }
}
