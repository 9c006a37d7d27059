//! The demo DVF pipeline, loaded from YAML and run against fakes.

use crate::common::{demos_dir, yearly_source};
use std::sync::Arc;
use tributary::config::{PipelineConfig, RetryConfig, TaskKindConfig};
use tributary::shims::InMemoryObjectStore;
use tributary::testing::{RecordingObserver, RecordingWarehouse};
use tributary::{
    GraphExecutor, PipelineGraph, PipelineLoader, RetryCondition, RunStatus, TaskError,
    TaskStatus, YamlLoader,
};

fn demo_config() -> PipelineConfig {
    YamlLoader::load_pipeline(demos_dir().join("pipeline.yaml")).unwrap()
}

/// The demo retries with backoffs of several minutes; tests run without.
fn without_retries(mut config: PipelineConfig) -> PipelineConfig {
    config.defaults.retry = None;
    for group in &mut config.groups {
        for task in &mut group.tasks {
            task.retry = None;
        }
    }
    config
}

fn command_of(config: &PipelineConfig, group: &str, task: &str) -> String {
    let task = config
        .groups
        .iter()
        .find(|g| g.id == group)
        .and_then(|g| g.tasks.iter().find(|t| t.id == task))
        .unwrap();
    match &task.kind {
        TaskKindConfig::Command { command } => command.clone(),
        other => panic!("{} is a {} task", task.id, other.name()),
    }
}

struct Fakes {
    store: Arc<InMemoryObjectStore>,
    warehouse: Arc<RecordingWarehouse>,
    observer: Arc<RecordingObserver>,
}

fn build(config: PipelineConfig, warehouse: RecordingWarehouse) -> (Arc<PipelineGraph>, Fakes) {
    let (catalog, fetcher) = yearly_source();
    let fakes = Fakes {
        store: Arc::new(InMemoryObjectStore::new()),
        warehouse: Arc::new(warehouse),
        observer: Arc::new(RecordingObserver::new()),
    };
    let graph = PipelineLoader::new(config)
        .with_base_dir(demos_dir())
        .with_object_store(fakes.store.clone())
        .with_warehouse(fakes.warehouse.clone())
        .with_source(catalog, fetcher)
        .with_failure_observer(fakes.observer.clone())
        .build()
        .unwrap();
    (Arc::new(graph), fakes)
}

#[test]
fn test_demo_pipeline_loads() {
    let config = demo_config();
    let (graph, _) = build(config, RecordingWarehouse::new());

    assert_eq!(graph.id().as_str(), "dvf_pipeline");
    assert_eq!(graph.task_count(), 15);
    assert_eq!(graph.max_concurrent_tasks(), 4);
    assert_eq!(graph.schedule().unwrap().expression(), "0 2 5 * *");
    let order: Vec<&str> = graph.topological_order().iter().map(|g| g.as_str()).collect();
    assert_eq!(
        order,
        vec!["start", "ingestion", "loading", "transformation", "quality", "end"]
    );

    let ingestion = graph.group(&"ingestion".into()).unwrap();
    let fetch = ingestion.task(&"fetch_to_store".into()).unwrap();
    assert_eq!(fetch.retry.total_attempts(), 4);
    let validate = ingestion.task(&"validate".into()).unwrap();
    assert_eq!(validate.retry.total_attempts(), 3);
    assert_eq!(validate.retry.retry_on, RetryCondition::TransientOnly);
    // An empty destination is fatal, not retried.
    assert!(!validate.retry.should_retry(
        1,
        &TaskError::EmptyResultSet("real-raw/*.txt".into())
    ));
}

#[tokio::test]
async fn test_demo_pipeline_end_to_end() {
    let (graph, fakes) = build(without_retries(demo_config()), RecordingWarehouse::new());

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Succeeded, "{:?}", result.failure);
    assert_eq!(result.completed_count(), 15);
    assert!(fakes.observer.failures().is_empty());

    let mut keys = fakes.store.keys();
    keys.sort();
    assert_eq!(keys, vec!["real-raw/items-2023.txt", "real-raw/items-2024.txt"]);

    let statements = fakes.warehouse.statements();
    assert_eq!(statements.len(), 3);
    assert!(statements[0].contains("CREATE DATABASE IF NOT EXISTS DVF_DB;"));
    assert!(statements[1].contains("URL = 's3://dvf-data-lake/real-raw/'"));
    assert!(statements[2].contains("FROM @DVF_DB.DEV_BRONZE.dvf_s3_stage"));
    // Positional column references are not variables.
    assert!(statements[2].contains("SELECT $1, $2"));
    assert!(statements.iter().all(|s| !s.contains("${")));

    let commands = fakes.warehouse.commands();
    assert_eq!(commands.len(), 7);
    assert!(commands[0].contains("dbt deps"));
    assert!(commands[3].contains("--select silver"));
    assert!(commands[6].starts_with("dbt test"));
}

#[tokio::test]
async fn test_demo_pipeline_fails_fast_on_transformation() {
    let config = without_retries(demo_config());
    let silver = command_of(&config, "transformation", "dbt_silver");
    let (graph, fakes) = build(
        config,
        RecordingWarehouse::new().exit_codes(silver, vec![1]),
    );

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.group_status("loading"), Some(TaskStatus::Succeeded));
    assert_eq!(result.group_status("transformation"), Some(TaskStatus::Failed));
    assert_eq!(result.group_status("quality"), Some(TaskStatus::Skipped));
    assert_eq!(result.group_status("end"), Some(TaskStatus::Skipped));
    assert_eq!(
        result.task_status("transformation", "dbt_staging"),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(
        result.task_status("transformation", "dbt_silver"),
        Some(TaskStatus::Failed)
    );
    for task in ["dbt_gold", "dbt_star_schema"] {
        assert_eq!(
            result.task_status("transformation", task),
            Some(TaskStatus::Skipped)
        );
    }
    assert_eq!(
        result.task_status("quality", "dbt_test"),
        Some(TaskStatus::Skipped)
    );

    // A failed attempt publishes no outputs.
    assert!(result.outputs.contains("transformation.dbt_staging.exit_code"));
    assert!(!result.outputs.contains("transformation.dbt_silver.exit_code"));

    // Nothing after silver reached the warehouse.
    let commands = fakes.warehouse.commands();
    assert_eq!(commands.len(), 4);
    assert!(commands.iter().all(|c| !c.contains("dbt test")));

    let failures = fakes.observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].failing_group.as_str(), "transformation");
    assert_eq!(failures[0].failing_task.as_str(), "dbt_silver");
    assert_eq!(failures[0].attempts, 1);
    assert!(failures[0].diagnostic.contains("transformation.dbt_silver"));
}

#[tokio::test]
async fn test_demo_pipeline_retries_flaky_command() {
    let mut config = without_retries(demo_config());
    let silver = command_of(&config, "transformation", "dbt_silver");
    for group in &mut config.groups {
        for task in &mut group.tasks {
            if task.id == "dbt_silver" {
                task.retry = Some(RetryConfig {
                    max_attempts: 2,
                    backoff: 0,
                    retry_on: RetryCondition::Always,
                });
            }
        }
    }
    let (graph, fakes) = build(
        config,
        RecordingWarehouse::new().exit_codes(silver.clone(), vec![1, 1, 0]),
    );

    let result = GraphExecutor::new().run(&graph).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let silver_result = result.get_task_result("transformation", "dbt_silver").unwrap();
    assert_eq!(silver_result.attempts, 3);
    assert!(silver_result.success);
    assert_eq!(
        fakes
            .warehouse
            .commands()
            .iter()
            .filter(|c| **c == silver)
            .count(),
        3
    );
    assert!(fakes.observer.failures().is_empty());
}
