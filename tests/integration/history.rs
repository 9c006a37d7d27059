//! Run history persisted in SQLite, recovery after an interrupted
//! process, and run leases shared between processes.

use crate::common::{ingestion_graph, yearly_source};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tributary::shims::InMemoryObjectStore;
use tributary::testing::{FlakyTask, RecordingObserver, SleepTask};
use tributary::{
    GraphId, HistoryRecord, PipelineGraph, RetryPolicy, RunId, RunLease, RunStatus, Scheduler,
    SchedulerError, SqliteStorage, Storage, TaskGroup, TaskNode, TaskStatus,
};

fn failing_graph(observer: Arc<RecordingObserver>) -> PipelineGraph {
    let loading = TaskGroup::builder("loading")
        .chain([
            TaskNode::new(FlakyTask::ok("create_objects")),
            TaskNode::new(FlakyTask::always("copy_into_bronze"))
                .with_retry(RetryPolicy::fixed(2, std::time::Duration::ZERO)),
        ])
        .build()
        .unwrap();
    let quality = TaskGroup::builder("quality")
        .task(TaskNode::new(FlakyTask::ok("dbt_test")))
        .build()
        .unwrap();
    PipelineGraph::builder("dvf", "DVF")
        .group(loading)
        .group_after(quality, &["loading"])
        .failure_observer(observer)
        .build()
        .unwrap()
}

fn slow_graph() -> PipelineGraph {
    let transformation = TaskGroup::builder("transformation")
        .chain([
            TaskNode::new(SleepTask::new("dbt_silver", Duration::from_millis(400))),
            TaskNode::new(FlakyTask::ok("dbt_gold")),
        ])
        .build()
        .unwrap();
    PipelineGraph::builder("dvf", "DVF")
        .group(transformation)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.db");
    let (catalog, fetcher) = yearly_source();
    let store = Arc::new(InMemoryObjectStore::new());

    let run_id = {
        let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let mut scheduler = Scheduler::new(storage.clone());
        scheduler.register(ingestion_graph(catalog, fetcher, store));
        let (handle, task) = scheduler.start().await;
        let result = handle.trigger_and_wait("dvf").await.unwrap();
        assert!(result.success());
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        storage.close().await;
        result.run_id
    };

    let reopened = SqliteStorage::new(&path).await.unwrap();
    let summary = reopened.run_summary(&run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.graph_id, GraphId::new("dvf"));
    assert_eq!(summary.groups["ingestion"], TaskStatus::Succeeded);
    assert_eq!(summary.tasks["ingestion.fetch_to_store"].attempts, 1);
    assert!(summary.finished_at.unwrap() >= summary.started_at);

    let records = reopened.records(&run_id).await.unwrap();
    assert_eq!(records.first().unwrap().kind(), "run_started");
    assert_eq!(records.last().unwrap().kind(), "run_finished");
}

#[tokio::test]
async fn test_failed_run_history_records_attempts_and_skips() {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let observer = Arc::new(RecordingObserver::new());
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(failing_graph(observer.clone()));
    let (handle, task) = scheduler.start().await;

    let result = handle.trigger_and_wait("dvf").await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);

    let summary = storage.run_summary(&result.run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    let copy = &summary.tasks["loading.copy_into_bronze"];
    assert_eq!(copy.status, TaskStatus::Failed);
    assert_eq!(copy.attempts, 3);
    assert!(copy.error.as_deref().unwrap().contains("copy_into_bronze failed"));
    let skipped = &summary.tasks["quality.dbt_test"];
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert_eq!(skipped.attempts, 0);
    assert_eq!(summary.groups["quality"], TaskStatus::Skipped);

    let failures = observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert_eq!(failures[0].run_id, result.run_id);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_recover_marks_interrupted_run_and_allows_rerun() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.db");
    let crashed = RunId::new();

    // A previous process started a run and died; its lease has lapsed.
    {
        let storage = SqliteStorage::new(&path).await.unwrap();
        storage
            .append(HistoryRecord::RunStarted {
                graph_id: GraphId::new("dvf"),
                run_id: crashed,
                at: Utc::now(),
            })
            .await
            .unwrap();
        storage
            .acquire_lease(&RunLease {
                graph_id: GraphId::new("dvf"),
                run_id: crashed,
                holder: "pid-crashed".into(),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        storage.close().await;
    }

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    assert_eq!(storage.unfinished_runs().await.unwrap().len(), 1);

    let (catalog, fetcher) = yearly_source();
    let store = Arc::new(InMemoryObjectStore::with_keys(["raw/items-2023.txt"]));
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(ingestion_graph(catalog, fetcher.clone(), store));

    let recovered = scheduler.recover().await.unwrap();
    assert_eq!(recovered, vec![crashed]);
    assert_eq!(
        storage.run_summary(&crashed).await.unwrap().status,
        RunStatus::Interrupted
    );
    assert!(storage.unfinished_runs().await.unwrap().is_empty());

    // Re-running only transfers what the crashed run did not.
    let (handle, task) = scheduler.start().await;
    let result = handle.trigger_and_wait("dvf").await.unwrap();
    assert!(result.success());
    assert_eq!(fetcher.fetched(), vec!["items-2024.zip"]);

    let runs = storage.recent_runs(&GraphId::new("dvf"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, result.run_id);
    assert_eq!(runs[1].status, RunStatus::Interrupted);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_second_process_leaves_live_run_alone() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.db");

    // The daemon.
    let daemon_storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let mut daemon = Scheduler::new(daemon_storage.clone());
    daemon.register(slow_graph());
    let (daemon_handle, daemon_task) = daemon.start().await;
    let live = daemon_handle.trigger("dvf").await.unwrap();

    // A one-shot trigger from another process, over the same database.
    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let mut scheduler = Scheduler::new(storage.clone());
    scheduler.register(slow_graph());
    assert!(scheduler.recover().await.unwrap().is_empty());
    let (handle, task) = scheduler.start().await;

    match handle.trigger_and_wait("dvf").await {
        Err(SchedulerError::RunAlreadyActive { graph, run_id }) => {
            assert_eq!(graph, "dvf");
            assert_eq!(run_id, live);
        }
        other => panic!("expected RunAlreadyActive, got {:?}", other.map(|r| r.status)),
    }
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let result = daemon_handle.wait(live).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        storage.run_summary(&live).await.unwrap().status,
        RunStatus::Succeeded
    );
    assert_eq!(storage.recent_runs(&GraphId::new("dvf"), 10).await.unwrap().len(), 1);
    assert!(storage.lease(&GraphId::new("dvf")).await.unwrap().is_none());

    daemon_handle.shutdown().await.unwrap();
    daemon_task.await.unwrap();
}
