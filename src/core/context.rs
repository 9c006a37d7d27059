//! Task execution context and inter-task communication.
//!
//! Tasks communicate through a run-scoped key-value store. Reading is shared,
//! writing is buffered per task and merged only on success:
//!
//! - [`ContextStore`]: outputs of tasks that completed in this run
//! - [`OutputBuffer`]: task-local writes, keys namespaced `"{group}.{task}.{key}"`
//! - [`TaskContext`]: what a task attempt sees: its upstream inputs, its
//!   output buffer and the pipeline environment

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::types::{RunId, TaskRef};

/// Errors that can occur when working with the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Key was not found in the context.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Failed to deserialize value from context.
    #[error("deserialization error for key '{key}': {message}")]
    DeserializationError { key: String, message: String },

    /// Failed to serialize value for context.
    #[error("serialization error for key '{key}': {message}")]
    SerializationError { key: String, message: String },

    /// Context lock was poisoned (concurrent access failure).
    #[error("context lock poisoned")]
    LockPoisoned,
}

/// Shared store of task outputs for one run.
///
/// In-memory and ephemeral; never persisted and never carried across runs.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("ContextStore").field("keys", &keys).finish()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with data.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Get a value by its full key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let store = self.inner.read().map_err(|_| ContextError::LockPoisoned)?;
        let value = store
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| ContextError::DeserializationError {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Get an optional value by key. Returns None if key doesn't exist.
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.inner.read().ok()?;
        let value = store.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|s| s.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy out the entries whose key starts with one of `prefixes`.
    ///
    /// The executor uses this to hand a task only the outputs of its declared
    /// upstream tasks.
    pub fn scoped(&self, prefixes: &[String]) -> Result<ContextStore, ContextError> {
        let store = self.inner.read().map_err(|_| ContextError::LockPoisoned)?;
        let data = store
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|p| key.starts_with(p.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(ContextStore::from_map(data))
    }

    /// Merge a task's output buffer into the store.
    ///
    /// Called by the executor after a successful attempt only.
    pub fn merge(&self, buffer: OutputBuffer) -> Result<(), ContextError> {
        let mut store = self.inner.write().map_err(|_| ContextError::LockPoisoned)?;
        store.extend(buffer.outputs);
        Ok(())
    }
}

/// Task-local output buffer.
///
/// Keys are prefixed with the writing task's group and name: calling
/// `set("transferred", ..)` from `ingestion.fetch_to_store` creates
/// `ingestion.fetch_to_store.transferred`.
#[derive(Debug)]
pub struct OutputBuffer {
    task: TaskRef,
    outputs: HashMap<String, Value>,
}

impl OutputBuffer {
    pub fn new(task: TaskRef) -> Self {
        Self {
            task,
            outputs: HashMap::new(),
        }
    }

    /// Write a value to the buffer under the task's namespace.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), ContextError> {
        let full_key = format!("{}.{}", self.task, key);
        let json_value =
            serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
                key: full_key.clone(),
                message: e.to_string(),
            })?;
        self.outputs.insert(full_key, json_value);
        Ok(())
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    /// Get a value from the buffer by its full key.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.outputs.get(key).cloned()
    }
}

/// Execution context passed to a task attempt.
pub struct TaskContext {
    /// The run this attempt belongs to.
    pub run_id: RunId,

    /// Outputs of upstream tasks (read-only).
    pub inputs: ContextStore,

    /// Outputs for downstream tasks (merged on success).
    pub outputs: OutputBuffer,

    /// Pipeline-level environment values.
    pub config: Arc<HashMap<String, Value>>,
}

impl TaskContext {
    pub fn new(
        run_id: RunId,
        inputs: ContextStore,
        task: TaskRef,
        config: Arc<HashMap<String, Value>>,
    ) -> Self {
        Self {
            run_id,
            inputs,
            outputs: OutputBuffer::new(task),
            config,
        }
    }

    /// The task this context was created for.
    pub fn task(&self) -> &TaskRef {
        self.outputs.task()
    }

    /// Get a configuration value by key.
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        self.config
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone()).map_err(|e| ContextError::DeserializationError {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
    }

    /// Get an optional configuration value.
    pub fn get_config_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
