//! Lifecycle events and event handling.
//!
//! The executor emits an [`Event`] for every run, group and task transition.
//! Handlers registered on an [`EventBus`] turn them into logs or run history.
//! Failed runs are additionally reported once to a [`FailureObserver`].

mod observer;

pub use observer::{FailureObserver, LoggingFailureObserver, RunFailure};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::{GraphId, GroupId, GroupStatus, RunId, RunStatus, TaskRef};

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone)]
pub enum Event {
    RunStarted {
        graph_id: GraphId,
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },

    GroupStarted {
        graph_id: GraphId,
        run_id: RunId,
        group: GroupId,
        timestamp: DateTime<Utc>,
    },

    /// A group reached a terminal state (including `Skipped`).
    GroupFinished {
        graph_id: GraphId,
        run_id: RunId,
        group: GroupId,
        status: GroupStatus,
        timestamp: DateTime<Utc>,
    },

    /// An attempt of a task started. `attempt` is 1-indexed.
    TaskStarted {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// An attempt failed and the task will be retried after its backoff.
    ///
    /// `max_attempts` is the total number of invocations the policy allows,
    /// including the first.
    TaskRetrying {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempt: u32,
        max_attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    TaskSucceeded {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempts: u32,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// A task failed terminally.
    TaskFailed {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A task was never dispatched.
    TaskSkipped {
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        timestamp: DateTime<Utc>,
    },

    RunFinished {
        graph_id: GraphId,
        run_id: RunId,
        status: RunStatus,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::RunStarted { timestamp, .. }
            | Event::GroupStarted { timestamp, .. }
            | Event::GroupFinished { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskRetrying { timestamp, .. }
            | Event::TaskSucceeded { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::RunFinished { timestamp, .. } => *timestamp,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::GroupStarted { run_id, .. }
            | Event::GroupFinished { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskRetrying { run_id, .. }
            | Event::TaskSucceeded { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::TaskSkipped { run_id, .. }
            | Event::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn graph_id(&self) -> &GraphId {
        match self {
            Event::RunStarted { graph_id, .. }
            | Event::GroupStarted { graph_id, .. }
            | Event::GroupFinished { graph_id, .. }
            | Event::TaskStarted { graph_id, .. }
            | Event::TaskRetrying { graph_id, .. }
            | Event::TaskSucceeded { graph_id, .. }
            | Event::TaskFailed { graph_id, .. }
            | Event::TaskSkipped { graph_id, .. }
            | Event::RunFinished { graph_id, .. } => graph_id,
        }
    }

    pub fn run_started(graph_id: GraphId, run_id: RunId) -> Self {
        Event::RunStarted {
            graph_id,
            run_id,
            timestamp: Utc::now(),
        }
    }

    pub fn group_started(graph_id: GraphId, run_id: RunId, group: GroupId) -> Self {
        Event::GroupStarted {
            graph_id,
            run_id,
            group,
            timestamp: Utc::now(),
        }
    }

    pub fn group_finished(
        graph_id: GraphId,
        run_id: RunId,
        group: GroupId,
        status: GroupStatus,
    ) -> Self {
        Event::GroupFinished {
            graph_id,
            run_id,
            group,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn task_started(graph_id: GraphId, run_id: RunId, task: TaskRef, attempt: u32) -> Self {
        Event::TaskStarted {
            graph_id,
            run_id,
            task,
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn task_retrying(
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempt: u32,
        max_attempts: u32,
        error: String,
    ) -> Self {
        Event::TaskRetrying {
            graph_id,
            run_id,
            task,
            attempt,
            max_attempts,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn task_succeeded(
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Event::TaskSucceeded {
            graph_id,
            run_id,
            task,
            attempts,
            duration,
            timestamp: Utc::now(),
        }
    }

    pub fn task_failed(
        graph_id: GraphId,
        run_id: RunId,
        task: TaskRef,
        attempts: u32,
        error: String,
    ) -> Self {
        Event::TaskFailed {
            graph_id,
            run_id,
            task,
            attempts,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn task_skipped(graph_id: GraphId, run_id: RunId, task: TaskRef) -> Self {
        Event::TaskSkipped {
            graph_id,
            run_id,
            task,
            timestamp: Utc::now(),
        }
    }

    pub fn run_finished(
        graph_id: GraphId,
        run_id: RunId,
        status: RunStatus,
        duration: Duration,
    ) -> Self {
        Event::RunFinished {
            graph_id,
            run_id,
            status,
            duration,
            timestamp: Utc::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
