//! Interfaces to the external systems tasks act on.
//!
//! Tasks receive shims through their constructors as `Arc<dyn ObjectStore>`
//! or `Arc<dyn Warehouse>`; nothing here is global.

mod local;
mod memory;
mod warehouse;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
pub use warehouse::CommandWarehouse;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors returned by shims.
#[derive(Debug, Error)]
pub enum ShimError {
    /// A create-if-absent write hit an existing object.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The warehouse rejected a statement.
    #[error("warehouse error: {0}")]
    Warehouse(String),

    /// An external process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Other(String),
}

/// Destination object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys under `prefix`, as stored (case preserved).
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, ShimError>;

    async fn exists(&self, key: &str) -> Result<bool, ShimError>;

    /// Write an object. With `overwrite == false` an existing key is an
    /// [`ShimError::AlreadyExists`] error and the stored object is untouched.
    async fn put(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<(), ShimError>;
}

/// Captured result of an external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The analytical warehouse and the processes that run against it.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute one or more SQL statements.
    async fn execute(&self, sql: &str) -> Result<(), ShimError>;

    /// Run an opaque command line (e.g. a transformation runner) and report
    /// its outcome. A nonzero exit code is not an error at this level.
    async fn run_external_process(&self, command_line: &str) -> Result<ProcessOutput, ShimError>;
}
