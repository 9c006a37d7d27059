//! Built-in task kinds.
//!
//! The sync stage tasks (`ingest`, `validate`) live in [`crate::sync`]; this
//! module holds the warehouse-facing kinds and the marker task.

mod command;
mod results;
mod sql;

pub use command::CommandTask;
pub use results::{QualityCounts, ResultsSummaryTask};
pub use sql::{SqlSource, SqlTask, interpolate};

use async_trait::async_trait;

use crate::core::context::TaskContext;
use crate::core::task::{Task, TaskError};

/// A task that does nothing. Used for synthetic `start`/`end` markers.
#[derive(Debug, Clone)]
pub struct NoopTask {
    name: String,
}

impl NoopTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Task for NoopTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}
