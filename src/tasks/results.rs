//! Quality summary of a transformation runner's results file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::core::context::TaskContext;
use crate::core::task::{Task, TaskError};

#[derive(Debug, Deserialize)]
struct RunResults {
    #[serde(default)]
    results: Vec<NodeResult>,
}

#[derive(Debug, Deserialize)]
struct NodeResult {
    #[serde(default)]
    status: String,
}

/// Test outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCounts {
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    pub total: usize,
}

impl QualityCounts {
    /// Count `pass` / `warn` / `fail` statuses of a `run_results.json`
    /// document. Other statuses only count towards `total`.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let doc: RunResults = serde_json::from_str(json)?;
        let mut counts = QualityCounts {
            total: doc.results.len(),
            ..Default::default()
        };
        for r in &doc.results {
            match r.status.as_str() {
                "pass" => counts.passed += 1,
                "warn" => counts.warned += 1,
                "fail" => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// Logs pass/warn/fail counts. Reporting only: an absent file is a warning
/// and the task still succeeds.
pub struct ResultsSummaryTask {
    name: String,
    path: PathBuf,
}

impl ResultsSummaryTask {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Task for ResultsSummaryTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "results file not found, skipping summary");
                return Ok(());
            }
            Err(e) => {
                return Err(TaskError::ExecutionFailed(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let counts = QualityCounts::parse(&body).map_err(|e| {
            TaskError::ExecutionFailed(format!("parsing {}: {}", self.path.display(), e))
        })?;
        info!(
            passed = counts.passed,
            warned = counts.warned,
            failed = counts.failed,
            total = counts.total,
            "quality summary"
        );
        ctx.outputs.set("counts", &counts)?;
        Ok(())
    }
}
