//! Opaque external process task.
//!
//! Used for the transformation runner: the process is a black box whose only
//! result is its exit code. On success stdout, stderr and the exit code are
//! written to the task outputs. A failed attempt publishes no outputs; its
//! exit code and stderr travel in [`TaskError::ExternalCommandFailed`] instead.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::context::TaskContext;
use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskError};
use crate::shims::Warehouse;

/// Runs a command line through [`Warehouse::run_external_process`].
///
/// A nonzero exit code fails the task with
/// [`TaskError::ExternalCommandFailed`].
#[derive(Clone)]
pub struct CommandTask {
    name: String,
    command_line: String,
    warehouse: Arc<dyn Warehouse>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl CommandTask {
    pub fn new(
        name: impl Into<String>,
        command_line: impl Into<String>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            warehouse,
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        debug!(command = %self.command_line, "running external process");
        let output = self
            .warehouse
            .run_external_process(&self.command_line)
            .await
            .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?;

        ctx.outputs.set("stdout", &output.stdout)?;
        ctx.outputs.set("stderr", &output.stderr)?;
        ctx.outputs.set("exit_code", output.exit_code)?;

        if output.success() {
            Ok(())
        } else {
            warn!(
                command = %self.command_line,
                exit_code = output.exit_code,
                "external process failed"
            );
            Err(TaskError::ExternalCommandFailed {
                code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn description(&self) -> Option<&str> {
        Some(&self.command_line)
    }
}
