//! Pipeline builder from YAML configuration.
//!
//! This module converts a [`PipelineConfig`] into a runnable
//! [`PipelineGraph`], constructing each task with the shims it needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::graph::PipelineGraph;
use crate::core::group::{TaskGroup, TaskNode};
use crate::core::retry::RetryPolicy;
use crate::core::schedule::Schedule;
use crate::core::task::Task;
use crate::events::{FailureObserver, LoggingFailureObserver};
use crate::shims::{CommandWarehouse, InMemoryObjectStore, LocalObjectStore, ObjectStore, Warehouse};
use crate::storage::{InMemoryStorage, Storage, StorageError};
use crate::sync::{Fetcher, HttpCatalog, HttpFetcher, IngestTask, SourceCatalog, ValidateTask};
use crate::tasks::{CommandTask, NoopTask, ResultsSummaryTask, SqlSource, SqlTask};

use super::error::ConfigError;
use super::types::{
    GroupConfig, ObjectStoreConfig, PipelineConfig, StorageConfig, TaskConfig, TaskKindConfig,
    WarehouseConfig,
};
use super::yaml::YamlLoader;

/// Default download timeout of ingest tasks.
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds a [`PipelineGraph`] from a pipeline definition.
///
/// Shims default to what the definition configures; any of them can be
/// injected instead, which is how tests run a real definition against fakes.
pub struct PipelineLoader {
    config: PipelineConfig,
    base_dir: PathBuf,
    object_store: Option<Arc<dyn ObjectStore>>,
    warehouse: Option<Arc<dyn Warehouse>>,
    source: Option<(Arc<dyn SourceCatalog>, Arc<dyn Fetcher>)>,
    observer: Option<Arc<dyn FailureObserver>>,
}

impl PipelineLoader {
    /// Relative paths in `config` resolve against the working directory.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            base_dir: PathBuf::new(),
            object_store: None,
            warehouse: None,
            source: None,
            observer: None,
        }
    }

    /// Load a definition; relative paths resolve against its directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = YamlLoader::load_pipeline(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self::new(config).with_base_dir(base_dir))
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_warehouse(mut self, warehouse: Arc<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Use `catalog` and `fetcher` for every ingest task instead of HTTP.
    pub fn with_source(mut self, catalog: Arc<dyn SourceCatalog>, fetcher: Arc<dyn Fetcher>) -> Self {
        self.source = Some((catalog, fetcher));
        self
    }

    /// Replace the default logging failure observer.
    pub fn with_failure_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the graph.
    pub fn build(&self) -> Result<PipelineGraph, ConfigError> {
        let config = &self.config;
        let object_store = match &self.object_store {
            Some(store) => Arc::clone(store),
            None => build_object_store(&config.object_store)?,
        };
        let warehouse = match (&self.warehouse, &config.warehouse) {
            (Some(warehouse), _) => Some(Arc::clone(warehouse)),
            (None, Some(warehouse)) => Some(build_warehouse(warehouse, &self.base_dir)?),
            (None, None) => None,
        };
        let shims = Shims {
            object_store,
            warehouse,
        };

        let mut builder = PipelineGraph::builder(config.id.as_str(), config.name.as_str())
            .environment(self.environment()?)
            .failure_observer(
                self.observer
                    .clone()
                    .unwrap_or_else(|| Arc::new(LoggingFailureObserver)),
            );

        if let Some(expression) = &config.schedule {
            let timezone = config.timezone.as_deref().unwrap_or("UTC");
            builder = builder.schedule(Schedule::with_timezone(expression, timezone)?);
        }

        if let Some(max) = config.max_concurrent_tasks {
            builder = builder.max_concurrent_tasks(max);
        }

        for group in &config.groups {
            builder = builder.group(self.build_group(group, &shims)?);
        }
        for group in &config.groups {
            for dep in &group.depends_on {
                builder = builder.depends(&group.id, dep);
            }
        }

        Ok(builder.build()?)
    }

    /// Pipeline environment as task configuration, with `${VAR}` expanded.
    fn environment(&self) -> Result<HashMap<String, Value>, ConfigError> {
        let mut environment = HashMap::new();
        for (key, value) in &self.config.environment {
            let value = match value {
                serde_yaml::Value::String(s) => {
                    Value::String(YamlLoader::expand_env(&format!("environment.{}", key), s)?)
                }
                other => serde_json::to_value(other)
                    .map_err(|e| ConfigError::InvalidConfig(format!("environment.{}: {}", key, e)))?,
            };
            environment.insert(key.clone(), value);
        }
        Ok(environment)
    }

    fn build_group(&self, config: &GroupConfig, shims: &Shims) -> Result<TaskGroup, ConfigError> {
        let mut builder = TaskGroup::builder(config.id.as_str());
        for task in &config.tasks {
            builder = builder.task(self.build_node(config, task, shims)?);
        }
        for task in &config.tasks {
            for dep in &task.depends_on {
                builder = builder.depends(&task.id, dep);
            }
        }
        Ok(builder.build()?)
    }

    fn build_node(
        &self,
        group: &GroupConfig,
        config: &TaskConfig,
        shims: &Shims,
    ) -> Result<TaskNode, ConfigError> {
        let task = self.build_task(group, config, shims)?;
        let retry = config
            .retry
            .as_ref()
            .or(self.config.defaults.retry.as_ref())
            .map(|r| r.to_policy())
            .unwrap_or_else(RetryPolicy::none);

        let mut node = TaskNode::from_arc(task).with_retry(retry);
        if let Some(timeout) = config.timeout() {
            node = node.with_timeout(timeout);
        }
        Ok(node)
    }

    /// Build a Task from TaskConfig.
    fn build_task(
        &self,
        group: &GroupConfig,
        config: &TaskConfig,
        shims: &Shims,
    ) -> Result<Arc<dyn Task>, ConfigError> {
        let name = config.id.as_str();
        let task: Arc<dyn Task> = match &config.kind {
            TaskKindConfig::Ingest {
                catalog_url,
                filter,
                layout,
                fetch_timeout,
            } => {
                let (catalog, fetcher) = match &self.source {
                    Some((catalog, fetcher)) => (Arc::clone(catalog), Arc::clone(fetcher)),
                    None => {
                        let field = format!("{}.{}.catalog_url", group.id, name);
                        let url = YamlLoader::expand_env(&field, catalog_url)?;
                        let timeout = fetch_timeout
                            .map(Duration::from_secs)
                            .unwrap_or(DEFAULT_FETCH_TIMEOUT);
                        let catalog: Arc<dyn SourceCatalog> =
                            Arc::new(HttpCatalog::new(url, filter.clone()));
                        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(timeout));
                        (catalog, fetcher)
                    }
                };
                Arc::new(IngestTask::new(
                    name,
                    catalog,
                    fetcher,
                    Arc::clone(&shims.object_store),
                    layout.clone(),
                ))
            }
            TaskKindConfig::Validate {
                prefix,
                suffix,
                summary_from,
            } => {
                let mut task =
                    ValidateTask::new(name, Arc::clone(&shims.object_store), prefix, suffix);
                if let Some(key) = summary_from {
                    task = task.with_summary_from(key);
                }
                Arc::new(task)
            }
            TaskKindConfig::Sql { sql, file } => {
                let source = match (sql, file) {
                    (Some(sql), None) => SqlSource::Inline(sql.clone()),
                    (None, Some(file)) => SqlSource::File(self.resolve(file)),
                    _ => {
                        return Err(ConfigError::InvalidConfig(format!(
                            "sql task '{}.{}' needs exactly one of 'sql' or 'file'",
                            group.id, name
                        )));
                    }
                };
                Arc::new(SqlTask::new(name, source, shims.warehouse_for(group, config)?))
            }
            TaskKindConfig::Command { command } => Arc::new(CommandTask::new(
                name,
                command.clone(),
                shims.warehouse_for(group, config)?,
            )),
            TaskKindConfig::Noop => Arc::new(NoopTask::new(name)),
            TaskKindConfig::ResultsSummary { path } => {
                Arc::new(ResultsSummaryTask::new(name, self.resolve(path)))
            }
        };
        Ok(task)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Shims shared by every task of one graph.
struct Shims {
    object_store: Arc<dyn ObjectStore>,
    warehouse: Option<Arc<dyn Warehouse>>,
}

impl Shims {
    fn warehouse_for(
        &self,
        group: &GroupConfig,
        task: &TaskConfig,
    ) -> Result<Arc<dyn Warehouse>, ConfigError> {
        self.warehouse.clone().ok_or_else(|| {
            ConfigError::MissingField(format!(
                "warehouse (required by {} task '{}.{}')",
                task.kind.name(),
                group.id,
                task.id
            ))
        })
    }
}

fn build_object_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    Ok(match config {
        ObjectStoreConfig::Memory => Arc::new(InMemoryObjectStore::new()),
        ObjectStoreConfig::Local { root } => Arc::new(LocalObjectStore::new(
            YamlLoader::expand_env("object_store.root", root)?,
        )),
    })
}

fn build_warehouse(
    config: &WarehouseConfig,
    base_dir: &Path,
) -> Result<Arc<dyn Warehouse>, ConfigError> {
    let client = config
        .sql_client
        .iter()
        .map(|arg| YamlLoader::expand_env("warehouse.sql_client", arg))
        .collect::<Result<Vec<_>, _>>()?;
    if client.is_empty() {
        return Err(ConfigError::MissingField("warehouse.sql_client".into()));
    }

    let mut env = HashMap::new();
    for (key, value) in &config.env {
        env.insert(
            key.clone(),
            YamlLoader::expand_env(&format!("warehouse.env.{}", key), value)?,
        );
    }

    let mut warehouse = CommandWarehouse::new(client).envs(env);
    if let Some(dir) = &config.working_dir {
        let dir = PathBuf::from(YamlLoader::expand_env("warehouse.working_dir", dir)?);
        warehouse = warehouse.working_dir(if dir.is_absolute() {
            dir
        } else {
            base_dir.join(dir)
        });
    }
    Ok(Arc::new(warehouse))
}

impl StorageConfig {
    /// Open the configured run history backend.
    pub async fn open(&self) -> Result<Arc<dyn Storage>, StorageError> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
            StorageConfig::Sqlite { path } => open_sqlite(path).await,
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &str) -> Result<Arc<dyn Storage>, StorageError> {
    let path = YamlLoader::expand_env("storage.path", path)
        .map_err(|e| StorageError::Other(e.to_string()))?;
    Ok(Arc::new(crate::storage::SqliteStorage::new(path).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_path: &str) -> Result<Arc<dyn Storage>, StorageError> {
    Err(StorageError::Other(
        "built without the `sqlite` feature".to_string(),
    ))
}
