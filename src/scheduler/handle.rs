//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the scheduler through commands like trigger, cancel, pause, resume, and
//! shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::types::{GraphId, RunId};
use crate::execution::RunResult;

use super::types::{RunWatch, SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    async fn trigger_watched(
        &self,
        graph_id: GraphId,
    ) -> Result<(RunId, RunWatch), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::Trigger { graph_id, response },
            "trigger",
        )
        .await
    }

    /// Trigger a graph manually.
    ///
    /// Fails with [`SchedulerError::RunAlreadyActive`] while a run of the same
    /// graph is in flight.
    pub async fn trigger(&self, graph_id: impl Into<GraphId>) -> Result<RunId, SchedulerError> {
        let (run_id, _) = self.trigger_watched(graph_id.into()).await?;
        Ok(run_id)
    }

    /// Trigger a graph and wait for the run to finish.
    pub async fn trigger_and_wait(
        &self,
        graph_id: impl Into<GraphId>,
    ) -> Result<RunResult, SchedulerError> {
        let (run_id, done) = self.trigger_watched(graph_id.into()).await?;
        await_result(run_id, done).await
    }

    /// Wait for an active run to finish.
    pub async fn wait(&self, run_id: RunId) -> Result<RunResult, SchedulerError> {
        let done = self
            .send_result_command(
                |response| SchedulerCommand::Watch { run_id, response },
                "watch",
            )
            .await?;
        await_result(run_id, done).await
    }

    /// Cancel an active run. Tasks already dispatched finish; nothing new starts.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::Cancel { run_id, response },
            "cancel",
        )
        .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, scheduled runs will not be triggered, but manual triggers still work.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler, waiting for in-flight runs up to the shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}

async fn await_result(run_id: RunId, mut done: RunWatch) -> Result<RunResult, SchedulerError> {
    let slot = done.wait_for(Option::is_some).await.map_err(|_| {
        SchedulerError::ChannelError(format!("run {} ended without a result", run_id))
    })?;
    (*slot)
        .clone()
        .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))
}
