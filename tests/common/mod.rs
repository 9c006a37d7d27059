//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tributary::testing::{MapFetcher, StaticCatalog, zip_bytes};
use tributary::{
    IngestTask, PipelineGraph, RunId, RunStatus, RunSummary, Storage, SyncLayout, TaskGroup,
    TaskNode, ValidateTask,
};
use tributary::shims::InMemoryObjectStore;

/// Root of the demo pipeline definitions.
pub fn demos_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos")
}

/// Source publishing `items-2023.zip` and `items-2024.zip`.
pub fn yearly_source() -> (Arc<StaticCatalog>, Arc<MapFetcher>) {
    let catalog = StaticCatalog::new(["items-2023.zip", "items-2024.zip"]);
    let fetcher = MapFetcher::new()
        .with(
            "items-2023.zip",
            zip_bytes(&[("items-2023.txt", "id|value\n1|10\n")]),
        )
        .with(
            "items-2024.zip",
            zip_bytes(&[("items-2024.txt", "id|value\n2|20\n")]),
        );
    (Arc::new(catalog), Arc::new(fetcher))
}

pub fn raw_layout() -> SyncLayout {
    SyncLayout {
        prefix: "raw/".into(),
        ..SyncLayout::default()
    }
}

/// `ingestion` group: sync into `store`, then check something landed.
pub fn ingestion_graph(
    catalog: Arc<StaticCatalog>,
    fetcher: Arc<MapFetcher>,
    store: Arc<InMemoryObjectStore>,
) -> Arc<PipelineGraph> {
    let group = TaskGroup::builder("ingestion")
        .chain([
            TaskNode::new(IngestTask::new(
                "fetch_to_store",
                catalog,
                fetcher,
                store.clone(),
                raw_layout(),
            )),
            TaskNode::new(
                ValidateTask::new("validate", store, "raw/", ".txt")
                    .with_summary_from("ingestion.fetch_to_store.summary"),
            ),
        ])
        .build()
        .unwrap();
    Arc::new(
        PipelineGraph::builder("dvf", "DVF ingestion")
            .group(group)
            .build()
            .unwrap(),
    )
}

/// Wait for a run's history to reach an expected status, polling storage.
///
/// Polls every 10ms and panics once `timeout` has elapsed.
pub async fn wait_for_run_status(
    storage: &dyn Storage,
    run_id: &RunId,
    expected: RunStatus,
    timeout: Duration,
) -> RunSummary {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(summary) = storage.run_summary(run_id).await {
            if summary.status == expected {
                return summary;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Timeout waiting for run {} to reach {:?}, current status: {:?}",
                    run_id, expected, summary.status
                );
            }
        } else if start.elapsed() > timeout {
            panic!("Timeout waiting for run {} to be recorded", run_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
