//! tributary - a dependency-ordered batch pipeline engine with idempotent resume.
//!
//! A [`PipelineGraph`] is a DAG of [`TaskGroup`]s, each itself a DAG of
//! tasks. The [`GraphExecutor`] dispatches a task as soon as its own
//! predecessors succeed, retries it per its [`RetryPolicy`], and never
//! dispatches anything downstream of a failure. The [`Scheduler`] triggers
//! runs from cron schedules or by hand, one in-flight run per graph, and
//! records run history through a [`Storage`] backend.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod shims;
pub mod storage;
pub mod sync;
pub mod tasks;
pub mod testing;

pub use config::{ConfigError, PipelineConfig, PipelineLoader, YamlLoader};
pub use core::context::{ContextError, ContextStore, OutputBuffer, TaskContext};
pub use core::dag::{DagError, DependencyGraph};
pub use core::graph::{GraphError, PipelineGraph, PipelineGraphBuilder};
pub use core::group::{TaskGroup, TaskGroupBuilder, TaskNode};
pub use core::retry::{RetryCondition, RetryPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::task::{Task, TaskError};
pub use core::types::{
    GraphId, GroupId, GroupStatus, RunId, RunStatus, TaskId, TaskRef, TaskStatus,
};
pub use events::{Event, EventBus, EventHandler, FailureObserver, LoggingFailureObserver, RunFailure};
pub use execution::{CancelSignal, GraphExecutor, RunResult, TaskExecutor, TaskResult};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use shims::{ObjectStore, ProcessOutput, ShimError, Warehouse};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    HistoryRecord, InMemoryStorage, LeaseGrant, RunLease, RunSummary, Storage, StorageError,
};
pub use sync::{IngestTask, SyncLayout, SyncSummary, ValidateTask};
