//! Run history storage.
//!
//! History is append-only: the engine writes [`HistoryRecord`]s as a run
//! progresses and never updates or deletes them. The state of a run is
//! whatever folding its records yields ([`RunSummary::fold`]).
//!
//! Next to the history, a store keeps at most one [`RunLease`] per graph.
//! A scheduler holds the lease while its run is in flight and renews it
//! before it expires, so other processes sharing the store can tell a live
//! run from one a crash left open.

mod memory;
mod recorder;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
pub use recorder::HistoryRecorder;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::types::{GraphId, GroupId, GroupStatus, RunId, RunStatus, TaskRef, TaskStatus};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationError(e.to_string())
    }
}

/// One immutable entry of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    RunStarted {
        graph_id: GraphId,
        run_id: RunId,
        at: DateTime<Utc>,
    },
    TaskFinished {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        status: TaskStatus,
        attempts: u32,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    GroupFinished {
        graph_id: GraphId,
        run_id: RunId,
        group: GroupId,
        status: GroupStatus,
        at: DateTime<Utc>,
    },
    RunFinished {
        graph_id: GraphId,
        run_id: RunId,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

impl HistoryRecord {
    pub fn run_id(&self) -> &RunId {
        match self {
            HistoryRecord::RunStarted { run_id, .. }
            | HistoryRecord::TaskFinished { run_id, .. }
            | HistoryRecord::GroupFinished { run_id, .. }
            | HistoryRecord::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn graph_id(&self) -> &GraphId {
        match self {
            HistoryRecord::RunStarted { graph_id, .. }
            | HistoryRecord::TaskFinished { graph_id, .. }
            | HistoryRecord::GroupFinished { graph_id, .. }
            | HistoryRecord::RunFinished { graph_id, .. } => graph_id,
        }
    }

    /// Stable name of the record kind, as stored.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryRecord::RunStarted { .. } => "run_started",
            HistoryRecord::TaskFinished { .. } => "task_finished",
            HistoryRecord::GroupFinished { .. } => "group_finished",
            HistoryRecord::RunFinished { .. } => "run_finished",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            HistoryRecord::RunStarted { at, .. }
            | HistoryRecord::TaskFinished { at, .. }
            | HistoryRecord::GroupFinished { at, .. }
            | HistoryRecord::RunFinished { at, .. } => *at,
        }
    }
}

/// Claim on a graph by the process executing one of its runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub graph_id: GraphId,
    pub run_id: RunId,
    /// Identifies the owning scheduler, for diagnostics.
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Outcome of [`Storage::acquire_lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Acquired,
    /// Another run holds an unexpired lease on the graph.
    Held(RunLease),
}

/// Terminal state of one task as recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// A run's state, folded from its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub graph_id: GraphId,
    /// `Running` until a `RunFinished` record exists.
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Keyed by `group.task`.
    pub tasks: BTreeMap<String, TaskSummary>,
    pub groups: BTreeMap<String, GroupStatus>,
}

impl RunSummary {
    /// Fold records in append order. Returns `None` without a `RunStarted`
    /// record. The first `RunFinished` wins.
    pub fn fold<'a, I>(records: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a HistoryRecord>,
    {
        let mut summary: Option<RunSummary> = None;
        for record in records {
            match record {
                HistoryRecord::RunStarted {
                    graph_id,
                    run_id,
                    at,
                } => {
                    summary.get_or_insert_with(|| RunSummary {
                        run_id: *run_id,
                        graph_id: graph_id.clone(),
                        status: RunStatus::Running,
                        started_at: *at,
                        finished_at: None,
                        tasks: BTreeMap::new(),
                        groups: BTreeMap::new(),
                    });
                }
                HistoryRecord::TaskFinished {
                    task,
                    status,
                    attempts,
                    error,
                    ..
                } => {
                    if let Some(s) = summary.as_mut() {
                        s.tasks.insert(
                            task.to_string(),
                            TaskSummary {
                                status: *status,
                                attempts: *attempts,
                                error: error.clone(),
                            },
                        );
                    }
                }
                HistoryRecord::GroupFinished { group, status, .. } => {
                    if let Some(s) = summary.as_mut() {
                        s.groups.insert(group.to_string(), *status);
                    }
                }
                HistoryRecord::RunFinished { status, at, .. } => {
                    if let Some(s) = summary.as_mut() {
                        if s.finished_at.is_none() {
                            s.status = *status;
                            s.finished_at = Some(*at);
                        }
                    }
                }
            }
        }
        summary
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Append-only store of run history.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append one record.
    async fn append(&self, record: HistoryRecord) -> Result<(), StorageError>;

    /// All records of a run, in append order.
    async fn records(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, StorageError>;

    /// `RunStarted` records of a graph, most recent first, at most `limit`.
    async fn started_runs(
        &self,
        graph_id: &GraphId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError>;

    /// `RunStarted` records with no matching `RunFinished`, across all graphs.
    async fn unfinished_runs(&self) -> Result<Vec<HistoryRecord>, StorageError>;

    /// Take the graph's lease unless a different run holds a live one.
    /// An expired lease is taken over.
    async fn acquire_lease(&self, lease: &RunLease) -> Result<LeaseGrant, StorageError>;

    /// Push the expiry of the lease `run_id` holds. Returns `false` when
    /// the run no longer holds it.
    async fn renew_lease(
        &self,
        graph_id: &GraphId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Drop the graph's lease if `run_id` holds it.
    async fn release_lease(&self, graph_id: &GraphId, run_id: &RunId) -> Result<(), StorageError>;

    /// Current lease of a graph, live or expired.
    async fn lease(&self, graph_id: &GraphId) -> Result<Option<RunLease>, StorageError>;

    /// Fold a run's records into its summary.
    async fn run_summary(&self, run_id: &RunId) -> Result<RunSummary, StorageError> {
        let records = self.records(run_id).await?;
        RunSummary::fold(&records).ok_or_else(|| StorageError::NotFound(format!("run: {}", run_id)))
    }

    /// Summaries of a graph's most recent runs.
    async fn recent_runs(
        &self,
        graph_id: &GraphId,
        limit: usize,
    ) -> Result<Vec<RunSummary>, StorageError> {
        let mut summaries = Vec::new();
        for started in self.started_runs(graph_id, limit).await? {
            summaries.push(self.run_summary(started.run_id()).await?);
        }
        Ok(summaries)
    }

    /// Close every unfinished run as `Interrupted`, except runs still
    /// holding a live lease. Returns the affected runs.
    async fn mark_unfinished_interrupted(&self) -> Result<Vec<RunId>, StorageError> {
        let now = Utc::now();
        let mut interrupted = Vec::new();
        for started in self.unfinished_runs().await? {
            if let Some(lease) = self.lease(started.graph_id()).await? {
                if lease.run_id == *started.run_id() && lease.is_live(now) {
                    continue;
                }
            }
            self.append(HistoryRecord::RunFinished {
                graph_id: started.graph_id().clone(),
                run_id: *started.run_id(),
                status: RunStatus::Interrupted,
                at: Utc::now(),
            })
            .await?;
            interrupted.push(*started.run_id());
        }
        Ok(interrupted)
    }
}
