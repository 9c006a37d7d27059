//! Configuration type definitions.
//!
//! This module contains the type definitions for a YAML pipeline definition:
//! the graph, its groups and tasks, retry policies and the shims it runs
//! against. Durations are whole seconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::retry::{RetryCondition, RetryPolicy};
use crate::sync::{ResourceFilter, SyncLayout};

/// A pipeline definition (one YAML document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Graph identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Cron expression or shortcut.
    pub schedule: Option<String>,
    /// IANA timezone of the schedule (default UTC).
    pub timezone: Option<String>,
    /// Per-run task concurrency.
    pub max_concurrent_tasks: Option<usize>,
    /// Values exposed to every task as configuration; `${VAR}` is expanded
    /// from the process environment at load time.
    #[serde(default)]
    pub environment: HashMap<String, serde_yaml::Value>,
    /// Run history backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Destination of ingested items.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Warehouse used by `sql` and `command` tasks.
    pub warehouse: Option<WarehouseConfig>,
    /// Defaults applied to tasks that do not override them.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Task groups.
    pub groups: Vec<GroupConfig>,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Object store configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObjectStoreConfig {
    /// Process-local store, gone when the process exits.
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// Directory tree on the local filesystem.
    #[serde(rename = "local")]
    Local {
        /// Root directory.
        root: String,
    },
}

/// Command-line warehouse configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// SQL client program and its arguments; SQL is piped to its stdin.
    pub sql_client: Vec<String>,
    /// Working directory of SQL and external commands.
    pub working_dir: Option<String>,
    /// Extra environment of SQL and external commands.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Pipeline-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Retry policy of tasks without their own.
    pub retry: Option<RetryConfig>,
}

/// Group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group identifier (unique within the pipeline).
    pub id: String,
    /// Groups that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tasks of the group.
    pub tasks: Vec<TaskConfig>,
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier (unique within its group).
    pub id: String,
    /// Task kind and its settings.
    #[serde(flatten)]
    pub kind: TaskKindConfig,
    /// Tasks of the same group that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Retry policy for this task.
    pub retry: Option<RetryConfig>,
    /// Per-attempt timeout in seconds.
    pub timeout: Option<u64>,
}

impl TaskConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Task kind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKindConfig {
    /// Idempotent sync of a source catalog into the object store.
    Ingest {
        /// URL of the JSON catalog document.
        catalog_url: String,
        /// Which resources to keep.
        #[serde(default)]
        filter: ResourceFilter,
        /// Destination layout.
        #[serde(default)]
        layout: SyncLayout,
        /// Download timeout in seconds.
        fetch_timeout: Option<u64>,
    },
    /// Fails unless the destination holds at least one expected item.
    Validate {
        /// Key prefix to inspect.
        #[serde(default)]
        prefix: String,
        /// Required item suffix.
        #[serde(default = "default_item_suffix")]
        suffix: String,
        /// Full context key of an upstream sync summary.
        summary_from: Option<String>,
    },
    /// SQL run through the warehouse.
    Sql {
        /// Inline statement(s).
        sql: Option<String>,
        /// Path of a SQL file, read at execution time.
        file: Option<PathBuf>,
    },
    /// External process run through the warehouse.
    Command {
        /// Shell command line.
        command: String,
    },
    /// Marker task that does nothing.
    Noop,
    /// Logs pass/warn/fail counts of a transformation run.
    ResultsSummary {
        /// Path of the runner's results file.
        path: PathBuf,
    },
}

fn default_item_suffix() -> String {
    ".txt".to_string()
}

impl TaskKindConfig {
    /// Configuration name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKindConfig::Ingest { .. } => "ingest",
            TaskKindConfig::Validate { .. } => "validate",
            TaskKindConfig::Sql { .. } => "sql",
            TaskKindConfig::Command { .. } => "command",
            TaskKindConfig::Noop => "noop",
            TaskKindConfig::ResultsSummary { .. } => "results_summary",
        }
    }

    /// Whether tasks of this kind need a warehouse.
    pub fn needs_warehouse(&self) -> bool {
        matches!(
            self,
            TaskKindConfig::Sql { .. } | TaskKindConfig::Command { .. }
        )
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Delay between attempts in seconds.
    #[serde(default)]
    pub backoff: u64,
    /// Which failures are retried.
    #[serde(default)]
    pub retry_on: RetryCondition,
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, Duration::from_secs(self.backoff))
            .with_condition(self.retry_on)
    }
}
