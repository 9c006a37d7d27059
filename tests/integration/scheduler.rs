//! Scheduler behavior with real graphs: one in-flight run per graph,
//! cancellation and repeated idempotent runs.

use crate::common::{ingestion_graph, wait_for_run_status, yearly_source};
use std::sync::Arc;
use std::time::Duration;
use tributary::shims::InMemoryObjectStore;
use tributary::testing::{FlakyTask, SleepTask};
use tributary::{
    GraphId, InMemoryStorage, PipelineGraph, RunStatus, Scheduler, SchedulerError, Storage,
    SyncSummary, TaskGroup, TaskNode, TaskStatus,
};

fn slow_graph(id: &str) -> PipelineGraph {
    let group = TaskGroup::builder("transformation")
        .chain([
            TaskNode::new(SleepTask::new("bronze", Duration::from_millis(300))),
            TaskNode::new(FlakyTask::ok("silver")),
        ])
        .build()
        .unwrap();
    PipelineGraph::builder(id, "Slow").group(group).build().unwrap()
}

#[tokio::test]
async fn test_single_in_flight_run_per_graph() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(slow_graph("slow"));
    scheduler.register(slow_graph("other"));
    let (handle, task) = scheduler.start().await;

    let first = handle.trigger("slow").await.unwrap();
    let rejected = handle.trigger("slow").await;
    match rejected {
        Err(SchedulerError::RunAlreadyActive { graph, run_id }) => {
            assert_eq!(graph, "slow");
            assert_eq!(run_id, first);
        }
        other => panic!("expected RunAlreadyActive, got {:?}", other.map(|r| r.to_string())),
    }

    // Another graph is unaffected.
    let other = handle.trigger("other").await.unwrap();

    let (result, other) = tokio::join!(handle.wait(first), handle.wait(other));
    assert_eq!(result.unwrap().status, RunStatus::Succeeded);
    assert!(other.unwrap().success());

    // Once the first run is done the graph can run again.
    let second = handle.trigger_and_wait("slow").await.unwrap();
    assert!(second.success());
    assert_ne!(second.run_id, first);

    let runs = storage.recent_runs(&GraphId::new("slow"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_graph() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(slow_graph("slow"));
    let (handle, task) = scheduler.start().await;

    let run_id = handle.trigger("slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel(run_id).await.unwrap();

    let result = handle.wait(run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(
        result.task_status("transformation", "silver"),
        Some(TaskStatus::Skipped)
    );

    let summary =
        wait_for_run_status(storage.as_ref(), &run_id, RunStatus::Cancelled, Duration::from_secs(2))
            .await;
    assert!(summary.is_finished());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_repeated_scheduled_sync_is_idempotent() {
    let (catalog, fetcher) = yearly_source();
    let store = Arc::new(InMemoryObjectStore::new());
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(ingestion_graph(catalog, fetcher.clone(), store.clone()));
    let (handle, task) = scheduler.start().await;

    let first = handle.trigger_and_wait("dvf").await.unwrap();
    let second = handle.trigger_and_wait("dvf").await.unwrap();

    assert!(first.success());
    assert!(second.success());
    let summary: SyncSummary = second
        .outputs
        .get("ingestion.fetch_to_store.summary")
        .unwrap();
    assert!(summary.transferred.is_empty());
    assert_eq!(summary.total, 2);
    assert_eq!(fetcher.fetched().len(), 2);
    assert_eq!(store.put_calls().len(), 2);

    let history = storage.run_summary(&second.run_id).await.unwrap();
    assert_eq!(history.status, RunStatus::Succeeded);
    assert_eq!(
        history.tasks["ingestion.validate"].status,
        TaskStatus::Succeeded
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
