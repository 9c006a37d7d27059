//! Idempotent sync stage.
//!
//! Copies published source items into the object store without ever
//! re-downloading or re-writing something the destination already holds.
//! The destination is listed once per run; that snapshot, normalized through
//! an [`IdentityFn`], answers every "already present?" question of the run,
//! both for whole containers (before download) and for the items inside them
//! (after expansion). Nothing is cached across runs: the destination itself
//! is the idempotency marker.

pub mod archive;
pub mod catalog;
mod task;

pub use catalog::{Fetcher, HttpCatalog, HttpFetcher, ResourceFilter, SourceCatalog, SourceItem};
pub use task::{IngestTask, ValidateTask};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::core::task::TaskError;
use crate::shims::{ObjectStore, ShimError};

/// Maps a destination key to the identity used for membership tests.
pub type IdentityFn = fn(&str) -> String;

/// Case-folding identity: `raw/ValeursFoncieres-2024.txt` and
/// `raw/valeursfoncieres-2024.txt` are the same object.
pub fn casefold(key: &str) -> String {
    key.to_lowercase()
}

/// Where items land and how container names map to destination names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLayout {
    /// Destination key prefix, e.g. `raw/`.
    pub prefix: String,
    /// Suffix marking a container, e.g. `.zip`.
    pub container_suffix: String,
    /// Suffix of the items worth keeping, e.g. `.txt`.
    pub inner_suffix: String,
}

impl Default for SyncLayout {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            container_suffix: ".zip".into(),
            inner_suffix: ".txt".into(),
        }
    }
}

fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len()
        && s.is_char_boundary(s.len() - suffix.len())
        && s[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

impl SyncLayout {
    pub fn is_container(&self, filename: &str) -> bool {
        !self.container_suffix.is_empty() && ends_with_ignore_case(filename, &self.container_suffix)
    }

    /// Destination name expected for a source file.
    ///
    /// One container suffix is stripped, then the inner suffix is appended if
    /// the remainder lacks it: `items-2023.txt.zip -> items-2023.txt`,
    /// `items-2024.zip -> items-2024.txt`.
    pub fn expected_name(&self, filename: &str) -> String {
        if !self.is_container(filename) {
            return filename.to_string();
        }
        let stem = &filename[..filename.len() - self.container_suffix.len()];
        if ends_with_ignore_case(stem, &self.inner_suffix) {
            stem.to_string()
        } else {
            format!("{}{}", stem, self.inner_suffix)
        }
    }

    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// A source item selected for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub source: SourceItem,
    pub expected_name: String,
}

/// Result of comparing the source listing with the destination snapshot.
#[derive(Debug, Clone)]
pub struct SyncManifest {
    pub source_items: Vec<SourceItem>,
    /// Normalized identities present at the destination when the run began.
    pub destination_items: HashSet<String>,
    pub to_transfer: Vec<PlannedItem>,
    /// Expected names whose container was skipped without download.
    pub skipped: Vec<String>,
    pub layout: SyncLayout,
    pub identity: IdentityFn,
}

impl SyncManifest {
    fn contains(&self, known: &HashSet<String>, name: &str) -> bool {
        known.contains(&(self.identity)(&self.layout.key_for(name)))
    }
}

/// Compute the minimal transfer set.
///
/// An item is skipped when the identity of its expected destination key is
/// in the snapshot; everything else is planned, under its original name.
pub fn plan_transfer(
    source_items: Vec<SourceItem>,
    destination: &BTreeSet<String>,
    layout: &SyncLayout,
    identity: IdentityFn,
) -> SyncManifest {
    let destination_items: HashSet<String> = destination.iter().map(|k| identity(k)).collect();
    let mut to_transfer = Vec::new();
    let mut skipped = Vec::new();

    for source in &source_items {
        let expected_name = layout.expected_name(&source.filename);
        if destination_items.contains(&identity(&layout.key_for(&expected_name))) {
            debug!(item = %source.filename, "already present, skipping download");
            skipped.push(expected_name);
        } else {
            to_transfer.push(PlannedItem {
                source: source.clone(),
                expected_name,
            });
        }
    }

    SyncManifest {
        source_items,
        destination_items,
        to_transfer,
        skipped,
        layout: layout.clone(),
        identity,
    }
}

/// Why an item did not make it to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The payload could not be downloaded.
    SourceUnavailable,
    /// The container or entry could not be read.
    CorruptPayload,
    /// The write to the destination failed.
    TransferFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Outcome of one sync run, written to the task output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub transferred: Vec<String>,
    pub skipped: Vec<String>,
    pub failed_items: Vec<FailedItem>,
    /// `transferred + skipped`.
    pub total: usize,
    /// Items that were downloaded and readable, whatever happened next.
    #[serde(skip)]
    readable: usize,
}

impl SyncSummary {
    fn fail(&mut self, item: impl Into<String>, kind: FailureKind, reason: impl Into<String>) {
        let item = item.into();
        let reason = reason.into();
        warn!(item = %item, kind = ?kind, reason = %reason, "item not transferred");
        self.failed_items.push(FailedItem { item, kind, reason });
    }

    /// Verdict for the task that ran the sync.
    ///
    /// Download and write failures fail the task so its retry policy reruns
    /// the stage. Corrupt payloads are tolerated unless nothing attempted was
    /// readable.
    pub fn outcome(&self) -> Result<(), TaskError> {
        if let Some(f) = self
            .failed_items
            .iter()
            .find(|f| f.kind == FailureKind::SourceUnavailable)
        {
            return Err(TaskError::SourceUnavailable(format!("{}: {}", f.item, f.reason)));
        }
        let transfer_failures: Vec<&str> = self
            .failed_items
            .iter()
            .filter(|f| f.kind == FailureKind::TransferFailed)
            .map(|f| f.item.as_str())
            .collect();
        if !transfer_failures.is_empty() {
            return Err(TaskError::TransferFailed(transfer_failures.join(", ")));
        }

        let corrupt: Vec<&FailedItem> = self
            .failed_items
            .iter()
            .filter(|f| f.kind == FailureKind::CorruptPayload)
            .collect();
        if !corrupt.is_empty() && self.readable == 0 {
            return Err(TaskError::CorruptPayload {
                item: corrupt
                    .iter()
                    .map(|f| f.item.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                reason: corrupt[0].reason.clone(),
            });
        }
        Ok(())
    }
}

/// Transfer everything in the manifest.
///
/// Writes are create-if-absent. Identities written during this run join the
/// snapshot so an inner name repeated across containers is written once.
pub async fn execute_transfer(
    manifest: &SyncManifest,
    fetcher: &dyn Fetcher,
    store: &dyn ObjectStore,
) -> SyncSummary {
    let mut summary = SyncSummary {
        skipped: manifest.skipped.clone(),
        ..SyncSummary::default()
    };
    let mut known = manifest.destination_items.clone();

    for planned in &manifest.to_transfer {
        let filename = &planned.source.filename;
        let bytes = match fetcher.fetch(&planned.source).await {
            Ok(bytes) => bytes,
            Err(e) => {
                summary.fail(filename.clone(), FailureKind::SourceUnavailable, e.to_string());
                continue;
            }
        };

        if !manifest.layout.is_container(filename) {
            upload(manifest, store, &mut known, &mut summary, &planned.expected_name, bytes)
                .await;
            continue;
        }

        let entries = match archive::expand(&bytes, &manifest.layout.inner_suffix) {
            Ok(entries) => entries,
            Err(reason) => {
                summary.fail(filename.clone(), FailureKind::CorruptPayload, reason);
                continue;
            }
        };
        debug!(container = %filename, entries = entries.len(), "container expanded");

        for entry in entries {
            match entry {
                Ok(entry) => {
                    upload(manifest, store, &mut known, &mut summary, &entry.name, entry.bytes)
                        .await
                }
                Err(e) => summary.fail(
                    format!("{}/{}", filename, e.name),
                    FailureKind::CorruptPayload,
                    e.reason,
                ),
            }
        }
    }

    summary.total = summary.transferred.len() + summary.skipped.len();
    info!(
        transferred = summary.transferred.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed_items.len(),
        "sync finished"
    );
    summary
}

async fn upload(
    manifest: &SyncManifest,
    store: &dyn ObjectStore,
    known: &mut HashSet<String>,
    summary: &mut SyncSummary,
    name: &str,
    bytes: Vec<u8>,
) {
    summary.readable += 1;
    if manifest.contains(known, name) {
        debug!(item = %name, "already present, not uploading");
        summary.skipped.push(name.to_string());
        return;
    }

    let key = manifest.layout.key_for(name);
    match store.put(&key, bytes, false).await {
        Ok(()) => {
            debug!(key = %key, "uploaded");
            known.insert((manifest.identity)(&key));
            summary.transferred.push(name.to_string());
        }
        Err(ShimError::AlreadyExists(_)) => {
            known.insert((manifest.identity)(&key));
            summary.skipped.push(name.to_string());
        }
        Err(e) => summary.fail(name, FailureKind::TransferFailed, e.to_string()),
    }
}
