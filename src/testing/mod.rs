//! Testing utilities for pipelines built on this crate.
//!
//! - [`StaticCatalog`] / [`MapFetcher`]: an in-memory source
//! - [`RecordingWarehouse`]: a warehouse that records statements and commands
//! - [`RecordingObserver`]: a failure observer that keeps every report
//! - [`FlakyTask`] / [`SleepTask`]: tasks for retry, timeout and ordering tests
//! - [`zip_bytes`] / [`corrupt_entry`]: container payload builders

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::context::TaskContext;
use crate::core::task::{Task, TaskError};
use crate::events::{FailureObserver, RunFailure};
use crate::shims::{ProcessOutput, ShimError, Warehouse};
use crate::sync::{Fetcher, SourceCatalog, SourceItem};

/// Shared, ordered log of task invocations.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Option<CallLog>, entry: String) {
    if let Some(log) = log {
        if let Ok(mut log) = log.lock() {
            log.push(entry);
        }
    }
}

/// A catalog with a fixed listing, or one that is always unavailable.
pub struct StaticCatalog {
    items: Result<Vec<SourceItem>, String>,
    calls: AtomicU32,
}

impl StaticCatalog {
    /// Items named by file name, with URLs under `https://source.test/`.
    pub fn new<I, S>(filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items = filenames
            .into_iter()
            .map(|f| SourceItem::new(format!("https://source.test/{}", f.as_ref()), f.as_ref()))
            .collect();
        Self {
            items: Ok(items),
            calls: AtomicU32::new(0),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            items: Err(reason.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn list(&self) -> Result<Vec<SourceItem>, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items
            .clone()
            .map_err(TaskError::SourceUnavailable)
    }
}

/// Serves payloads by file name and counts downloads.
#[derive(Default)]
pub struct MapFetcher {
    payloads: HashMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.payloads.insert(filename.into(), bytes);
        self
    }

    /// File names fetched so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Fetcher for MapFetcher {
    async fn fetch(&self, item: &SourceItem) -> Result<Vec<u8>, TaskError> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(item.filename.clone());
        }
        self.payloads
            .get(&item.filename)
            .cloned()
            .ok_or_else(|| TaskError::SourceUnavailable(format!("404 {}", item.url)))
    }
}

/// Records SQL and command lines; commands answer with scripted exit codes.
#[derive(Default)]
pub struct RecordingWarehouse {
    statements: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    exit_codes: Mutex<HashMap<String, Vec<i32>>>,
    failing_sql: Option<String>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer invocations of `command_line` with these exit codes in turn;
    /// once exhausted, the last code repeats.
    pub fn exit_codes(self, command_line: impl Into<String>, codes: Vec<i32>) -> Self {
        if let Ok(mut map) = self.exit_codes.lock() {
            map.insert(command_line.into(), codes);
        }
        self
    }

    /// Reject any statement containing `fragment`.
    pub fn fail_sql_containing(mut self, fragment: impl Into<String>) -> Self {
        self.failing_sql = Some(fragment.into());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn execute(&self, sql: &str) -> Result<(), ShimError> {
        self.statements
            .lock()
            .map_err(|_| ShimError::LockPoisoned)?
            .push(sql.to_string());
        match &self.failing_sql {
            Some(fragment) if sql.contains(fragment.as_str()) => {
                Err(ShimError::Warehouse(format!("rejected: {}", fragment)))
            }
            _ => Ok(()),
        }
    }

    async fn run_external_process(&self, command_line: &str) -> Result<ProcessOutput, ShimError> {
        self.commands
            .lock()
            .map_err(|_| ShimError::LockPoisoned)?
            .push(command_line.to_string());

        let mut codes = self.exit_codes.lock().map_err(|_| ShimError::LockPoisoned)?;
        let exit_code = match codes.get_mut(command_line) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue.first().copied().unwrap_or(0),
            None => 0,
        };
        Ok(ProcessOutput {
            exit_code,
            stdout: format!("ran {}", command_line),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", command_line)
            },
        })
    }
}

/// Keeps every failure report it receives.
#[derive(Default)]
pub struct RecordingObserver {
    failures: Mutex<Vec<RunFailure>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<RunFailure> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FailureObserver for RecordingObserver {
    async fn on_failure(&self, failure: &RunFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure.clone());
        }
    }
}

/// A task that fails a configurable number of times before succeeding.
///
/// `FlakyTask::new("t", u32::MAX)` never succeeds.
pub struct FlakyTask {
    name: String,
    failures: u32,
    calls: Arc<AtomicU32>,
    error: fn(&str) -> TaskError,
    log: Option<CallLog>,
}

impl FlakyTask {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
            error: |name| TaskError::ExecutionFailed(format!("{} failed", name)),
            log: None,
        }
    }

    /// A task that fails on every attempt.
    pub fn always(name: impl Into<String>) -> Self {
        Self::new(name, u32::MAX)
    }

    /// A task that succeeds on its first attempt.
    pub fn ok(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }

    pub fn with_error(mut self, error: fn(&str) -> TaskError) -> Self {
        self.error = error;
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Shared handle to the invocation counter.
    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl Task for FlakyTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        record(&self.log, ctx.task().to_string());
        if call <= self.failures {
            return Err((self.error)(&self.name));
        }
        ctx.outputs.set("attempt", call)?;
        Ok(())
    }
}

/// A task that sleeps, then succeeds.
pub struct SleepTask {
    name: String,
    duration: Duration,
    log: Option<CallLog>,
}

impl SleepTask {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            log: None,
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }
}

#[async_trait]
impl Task for SleepTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        record(&self.log, format!("{}:start", ctx.task()));
        tokio::time::sleep(self.duration).await;
        record(&self.log, format!("{}:end", ctx.task()));
        Ok(())
    }
}

/// Build a zip container from `(entry name, content)` pairs.
///
/// Entries are stored uncompressed so their content appears verbatim in the
/// returned bytes.
///
/// # Panics
///
/// Panics if the in-memory writer fails.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer
            .start_file(*name, options)
            .expect("failed to start zip entry");
        writer
            .write_all(content.as_bytes())
            .expect("failed to write zip entry");
    }
    writer
        .finish()
        .expect("failed to finish zip")
        .into_inner()
}

/// Damage the stored content `marker` inside a container built by
/// [`zip_bytes`], so that entry fails its checksum while the others stay
/// readable.
pub fn corrupt_entry(mut bytes: Vec<u8>, marker: &str) -> Vec<u8> {
    let needle = marker.as_bytes();
    if let Some(pos) = bytes.windows(needle.len()).position(|w| w == needle) {
        for b in &mut bytes[pos..pos + needle.len()] {
            *b = b'#';
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ContextStore;
    use crate::core::types::{RunId, TaskRef};

    fn ctx() -> TaskContext {
        TaskContext::new(
            RunId::new(),
            ContextStore::new(),
            TaskRef::new("g", "flaky"),
            Arc::new(HashMap::new()),
        )
    }

    #[tokio::test]
    async fn test_flaky_task_fails_then_succeeds() {
        let task = FlakyTask::new("flaky", 2);
        let counter = task.counter();

        assert!(task.execute(&mut ctx()).await.is_err());
        assert!(task.execute(&mut ctx()).await.is_err());
        assert!(task.execute(&mut ctx()).await.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_flaky_task_custom_error() {
        let task = FlakyTask::always("fetch")
            .with_error(|_| TaskError::SourceUnavailable("503".into()));

        let err = task.execute(&mut ctx()).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_recording_warehouse_scripted_exit_codes() {
        let wh = RecordingWarehouse::new().exit_codes("dbt test", vec![1, 0]);

        assert_eq!(wh.run_external_process("dbt test").await.unwrap().exit_code, 1);
        assert_eq!(wh.run_external_process("dbt test").await.unwrap().exit_code, 0);
        assert_eq!(wh.run_external_process("dbt test").await.unwrap().exit_code, 0);
        assert_eq!(wh.run_external_process("dbt deps").await.unwrap().exit_code, 0);
        assert_eq!(wh.commands().len(), 4);
    }

    #[tokio::test]
    async fn test_static_catalog_and_fetcher() {
        let catalog = StaticCatalog::new(["a.zip"]);
        let fetcher = MapFetcher::new().with("a.zip", vec![1, 2, 3]);

        let items = catalog.list().await.unwrap();
        let bytes = fetcher.fetch(&items[0]).await.unwrap();

        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(catalog.calls(), 1);
        assert_eq!(fetcher.fetched(), vec!["a.zip"]);
    }

    #[test]
    fn test_corrupt_entry_changes_only_marker() {
        let original = zip_bytes(&[("a.txt", "KEEP"), ("b.txt", "BREAK")]);
        let damaged = corrupt_entry(original.clone(), "BREAK");

        assert_eq!(original.len(), damaged.len());
        assert_ne!(original, damaged);
    }
}
