//! Idempotent sync across repeated pipeline runs.

use crate::common::{ingestion_graph, raw_layout, yearly_source};
use std::collections::BTreeSet;
use std::sync::Arc;
use tributary::shims::InMemoryObjectStore;
use tributary::sync::{FailureKind, plan_transfer};
use tributary::testing::{MapFetcher, StaticCatalog, corrupt_entry, zip_bytes};
use tributary::{GraphExecutor, RunStatus, SyncSummary, TaskStatus};

#[tokio::test]
async fn test_sync_transfers_only_missing_year() {
    let (catalog, fetcher) = yearly_source();
    // Present under a different case; must count as the same item.
    let store = Arc::new(InMemoryObjectStore::with_keys(["raw/Items-2023.TXT"]));
    let graph = ingestion_graph(catalog, fetcher.clone(), store.clone());

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let summary: SyncSummary = result
        .outputs
        .get("ingestion.fetch_to_store.summary")
        .unwrap();
    assert_eq!(summary.transferred, vec!["items-2024.txt"]);
    assert_eq!(summary.skipped, vec!["items-2023.txt"]);
    assert_eq!(summary.total, 2);

    // The 2023 container was never downloaded.
    assert_eq!(fetcher.fetched(), vec!["items-2024.zip"]);
    assert_eq!(store.put_calls(), vec!["raw/items-2024.txt"]);
    assert_eq!(
        store.get("raw/items-2024.txt").unwrap(),
        b"id|value\n2|20\n".to_vec()
    );
}

#[tokio::test]
async fn test_rerun_transfers_nothing() {
    let (catalog, fetcher) = yearly_source();
    let store = Arc::new(InMemoryObjectStore::new());
    let graph = ingestion_graph(catalog.clone(), fetcher.clone(), store.clone());

    let first = GraphExecutor::new().run(&graph).await;
    assert!(first.success());
    let transferred: Vec<String> = first
        .outputs
        .get("ingestion.fetch_to_store.transferred")
        .unwrap();
    assert_eq!(transferred.len(), 2);

    let second = GraphExecutor::new().run(&graph).await;
    assert!(second.success());
    let summary: SyncSummary = second
        .outputs
        .get("ingestion.fetch_to_store.summary")
        .unwrap();
    assert!(summary.transferred.is_empty());
    assert_eq!(summary.skipped.len(), 2);
    assert_eq!(summary.total, 2);

    // Two downloads and two writes in total, all from the first run.
    assert_eq!(fetcher.fetched().len(), 2);
    assert_eq!(store.put_calls().len(), 2);
    assert_eq!(catalog.calls(), 2);
}

#[tokio::test]
async fn test_partially_corrupt_container_keeps_readable_entries() {
    let bytes = corrupt_entry(
        zip_bytes(&[
            ("items-2024-a.txt", "id|value\n1|KEEP\n"),
            ("items-2024-b.txt", "id|value\n2|BREAK\n"),
        ]),
        "BREAK",
    );
    let catalog = Arc::new(StaticCatalog::new(["items-2024.zip"]));
    let fetcher = Arc::new(MapFetcher::new().with("items-2024.zip", bytes));
    let store = Arc::new(InMemoryObjectStore::new());
    let graph = ingestion_graph(catalog, fetcher, store.clone());

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let summary: SyncSummary = result
        .outputs
        .get("ingestion.fetch_to_store.summary")
        .unwrap();
    assert_eq!(summary.transferred, vec!["items-2024-a.txt"]);
    assert_eq!(summary.failed_items.len(), 1);
    assert_eq!(summary.failed_items[0].kind, FailureKind::CorruptPayload);
    assert!(summary.failed_items[0].item.ends_with("items-2024-b.txt"));
    assert!(store.get("raw/items-2024-b.txt").is_none());
}

#[tokio::test]
async fn test_unreadable_source_fails_run_and_skips_validation() {
    let catalog = Arc::new(StaticCatalog::new(["items-2024.zip"]));
    let fetcher = Arc::new(MapFetcher::new().with("items-2024.zip", b"not a zip".to_vec()));
    let store = Arc::new(InMemoryObjectStore::new());
    let graph = ingestion_graph(catalog, fetcher, store.clone());

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.task_status("ingestion", "fetch_to_store"),
        Some(TaskStatus::Failed)
    );
    assert_eq!(
        result.task_status("ingestion", "validate"),
        Some(TaskStatus::Skipped)
    );
    assert!(store.put_calls().is_empty());
}

#[tokio::test]
async fn test_write_failure_leaves_existing_objects_untouched() {
    let (catalog, fetcher) = yearly_source();
    let store = Arc::new(InMemoryObjectStore::with_keys(["raw/items-2023.txt"]));
    store.fail_puts_for("raw/items-2024.txt").unwrap();
    let graph = ingestion_graph(catalog, fetcher, store.clone());

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.failing_task.as_str(), "fetch_to_store");
    assert_eq!(store.get("raw/items-2023.txt").unwrap(), Vec::<u8>::new());
    assert_eq!(store.put_calls(), vec!["raw/items-2024.txt"]);
}

#[test]
fn test_plan_is_case_insensitive() {
    let source = vec![
        tributary::sync::SourceItem::new("https://source.test/ITEMS-2023.ZIP", "ITEMS-2023.ZIP"),
        tributary::sync::SourceItem::new("https://source.test/items-2024.zip", "items-2024.zip"),
    ];
    let destination: BTreeSet<String> = ["raw/items-2023.txt".to_string()].into_iter().collect();

    let manifest = plan_transfer(source, &destination, &raw_layout(), tributary::sync::casefold);

    assert_eq!(manifest.skipped, vec!["ITEMS-2023.txt"]);
    assert_eq!(manifest.to_transfer.len(), 1);
    assert_eq!(manifest.to_transfer[0].expected_name, "items-2024.txt");
}
