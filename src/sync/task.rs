use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    Fetcher, IdentityFn, SourceCatalog, SyncLayout, SyncSummary, casefold, execute_transfer,
    plan_transfer,
};
use crate::core::context::TaskContext;
use crate::core::task::{Task, TaskError};
use crate::shims::ObjectStore;

/// Runs the sync stage: list source, snapshot destination, transfer the gap.
///
/// Outputs `summary` (a [`SyncSummary`]) plus `transferred`, `skipped` and
/// `total` for downstream tasks.
pub struct IngestTask {
    name: String,
    catalog: Arc<dyn SourceCatalog>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ObjectStore>,
    layout: SyncLayout,
    identity: IdentityFn,
}

impl IngestTask {
    pub fn new(
        name: impl Into<String>,
        catalog: Arc<dyn SourceCatalog>,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ObjectStore>,
        layout: SyncLayout,
    ) -> Self {
        Self {
            name: name.into(),
            catalog,
            fetcher,
            store,
            layout,
            identity: casefold,
        }
    }

    pub fn with_identity(mut self, identity: IdentityFn) -> Self {
        self.identity = identity;
        self
    }
}

#[async_trait]
impl Task for IngestTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let source = self.catalog.list().await?;
        info!(items = source.len(), "source catalog listed");

        // The only destination listing of this run.
        let snapshot = self.store.list(&self.layout.prefix).await.map_err(|e| {
            TaskError::TransferFailed(format!("listing {}: {}", self.layout.prefix, e))
        })?;
        info!(
            present = snapshot.len(),
            prefix = %self.layout.prefix,
            "destination snapshot taken"
        );

        let manifest = plan_transfer(source, &snapshot, &self.layout, self.identity);
        let summary: SyncSummary =
            execute_transfer(&manifest, self.fetcher.as_ref(), self.store.as_ref()).await;

        ctx.outputs.set("transferred", &summary.transferred)?;
        ctx.outputs.set("skipped", &summary.skipped)?;
        ctx.outputs.set("total", summary.total)?;
        ctx.outputs.set("summary", &summary)?;

        summary.outcome()
    }

    fn description(&self) -> Option<&str> {
        Some("sync published source items into the object store")
    }
}

/// Fails with [`TaskError::EmptyResultSet`] unless the destination holds at
/// least one item with the expected suffix.
///
/// The destination is listed afresh; an upstream ingest summary, if one is
/// readable, is only used for reporting.
pub struct ValidateTask {
    name: String,
    store: Arc<dyn ObjectStore>,
    prefix: String,
    suffix: String,
    summary_key: Option<String>,
}

impl ValidateTask {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            prefix: prefix.into(),
            suffix: suffix.into(),
            summary_key: None,
        }
    }

    /// Full context key of an upstream [`SyncSummary`], e.g.
    /// `ingestion.fetch_to_store.summary`.
    pub fn with_summary_from(mut self, key: impl Into<String>) -> Self {
        self.summary_key = Some(key.into());
        self
    }
}

#[async_trait]
impl Task for ValidateTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let keys = self
            .store
            .list(&self.prefix)
            .await
            .map_err(|e| TaskError::ExecutionFailed(format!("listing {}: {}", self.prefix, e)))?;
        let suffix = self.suffix.to_ascii_lowercase();
        let matching = keys
            .iter()
            .filter(|k| k.to_ascii_lowercase().ends_with(&suffix))
            .count();

        if matching == 0 {
            return Err(TaskError::EmptyResultSet(format!(
                "{}*{}",
                self.prefix, self.suffix
            )));
        }

        match self
            .summary_key
            .as_deref()
            .map(|k| ctx.inputs.get_optional::<SyncSummary>(k))
        {
            Some(Some(summary)) => info!(
                available = matching,
                transferred = summary.transferred.len(),
                skipped = summary.skipped.len(),
                "destination validated"
            ),
            Some(None) => {
                warn!(available = matching, "destination validated, upstream summary missing")
            }
            None => info!(available = matching, "destination validated"),
        }

        ctx.outputs.set("available", matching)?;
        Ok(())
    }
}
