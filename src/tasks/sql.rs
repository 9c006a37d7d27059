//! SQL statements executed through the warehouse.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::context::TaskContext;
use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskError};
use crate::shims::Warehouse;

/// Where a task's SQL comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlSource {
    Inline(String),
    /// Read when the task executes, so edits apply to the next run.
    File(PathBuf),
}

/// Executes SQL after substituting `${VAR}` references from the pipeline
/// environment.
///
/// DDL such as `CREATE ... IF NOT EXISTS` and `COPY INTO` with load history
/// are the idempotent statements this kind is meant for.
#[derive(Clone)]
pub struct SqlTask {
    name: String,
    source: SqlSource,
    warehouse: Arc<dyn Warehouse>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl SqlTask {
    pub fn new(name: impl Into<String>, source: SqlSource, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            name: name.into(),
            source,
            warehouse,
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn inline(
        name: impl Into<String>,
        sql: impl Into<String>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self::new(name, SqlSource::Inline(sql.into()), warehouse)
    }

    pub fn file(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self::new(name, SqlSource::File(path.into()), warehouse)
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source(&self) -> &SqlSource {
        &self.source
    }

    async fn load(&self) -> Result<String, TaskError> {
        match &self.source {
            SqlSource::Inline(sql) => Ok(sql.clone()),
            SqlSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                TaskError::ExecutionFailed(format!("reading {}: {}", path.display(), e))
            }),
        }
    }
}

#[async_trait]
impl Task for SqlTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let template = self.load().await?;
        let sql = interpolate(&template, |var| match ctx.config.get(var) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .map_err(TaskError::ExecutionFailed)?;

        self.warehouse
            .execute(&sql)
            .await
            .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?;

        info!(bytes = sql.len(), "sql executed");
        ctx.outputs.set("executed", true)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Replace every `${NAME}` in `text` with `lookup(NAME)`.
///
/// An unknown name or an unterminated reference is an error naming it. `$`
/// not followed by `{` is kept as is.
pub fn interpolate<F>(text: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated variable reference in '{}'", &rest[start..]))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| format!("undefined variable ${{{}}}", name))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
