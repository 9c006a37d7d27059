//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use crate::core::types::{GraphId, RunId};
use crate::execution::RunResult;
use crate::storage::StorageError;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Graph not registered.
    #[error("graph not found: {0}")]
    GraphNotFound(String),

    /// Run not active.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A run of the graph is still in flight.
    #[error("graph {graph} already has an active run: {run_id}")]
    RunAlreadyActive { graph: String, run_id: RunId },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Completion slot of a run; `None` while the run is in flight.
pub(crate) type RunWatch = watch::Receiver<Option<RunResult>>;

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Trigger a graph manually.
    Trigger {
        graph_id: GraphId,
        response: oneshot::Sender<Result<(RunId, RunWatch), SchedulerError>>,
    },
    /// Ask an active run to stop dispatching.
    Cancel {
        run_id: RunId,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Subscribe to an active run's completion.
    Watch {
        run_id: RunId,
        response: oneshot::Sender<Result<RunWatch, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
