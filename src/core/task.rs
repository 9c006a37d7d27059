//! Task trait and error types.
//!
//! A [`Task`] is one side-effecting operation against an external system.
//! Actions must be safe to re-invoke: they consult live external state rather
//! than assuming a previous attempt did nothing.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::context::TaskContext;
use super::retry::RetryPolicy;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The source catalog could not be reached or answered with an error.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A container or one of its entries could not be read.
    #[error("corrupt payload '{item}': {reason}")]
    CorruptPayload { item: String, reason: String },

    /// Writing an item to the destination failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Validation found nothing where data was expected.
    #[error("no matching items found under {0}")]
    EmptyResultSet(String),

    /// An external process exited with a nonzero status.
    #[error("external command exited with code {code}: {stderr}")]
    ExternalCommandFailed { code: i32, stderr: String },

    /// Task exceeded its execution timeout.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// Task execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Error accessing task context.
    #[error("context error: {0}")]
    Context(#[from] super::context::ContextError),
}

impl TaskError {
    /// Check if this error is considered transient (should trigger retry
    /// under [`RetryCondition::TransientOnly`](super::retry::RetryCondition)).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::SourceUnavailable(_) | TaskError::TransferFailed(_) | TaskError::Timeout(_)
        )
    }
}

/// The core trait for defining executable tasks.
///
/// # Example
///
/// ```ignore
/// use tributary::{Task, TaskContext, TaskError};
/// use async_trait::async_trait;
///
/// struct CountRows;
///
/// #[async_trait]
/// impl Task for CountRows {
///     fn name(&self) -> &str {
///         "count_rows"
///     }
///
///     async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
///         let loaded: u64 = ctx.inputs.get("loading.copy_into_bronze.rows")?;
///         ctx.outputs.set("rows", loaded)?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Name of the task, unique within its group.
    fn name(&self) -> &str;

    /// Execute one attempt of the task.
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError>;

    /// Default retry policy; a group may override it per node.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Default per-attempt timeout; a group may override it per node.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}
