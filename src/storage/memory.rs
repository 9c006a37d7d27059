//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use super::{HistoryRecord, LeaseGrant, RunLease, Storage, StorageError};
use crate::core::types::{GraphId, RunId};

/// In-memory storage backend.
///
/// Records are kept in one append-ordered log. Data is not persisted across
/// restarts.
#[derive(Default)]
pub struct InMemoryStorage {
    log: RwLock<Vec<HistoryRecord>>,
    leases: Mutex<HashMap<GraphId, RunLease>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn append(&self, record: HistoryRecord) -> Result<(), StorageError> {
        let mut log = self.log.write().map_err(|_| StorageError::LockPoisoned)?;
        log.push(record);
        Ok(())
    }

    async fn records(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, StorageError> {
        let log = self.log.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(log.iter().filter(|r| r.run_id() == run_id).cloned().collect())
    }

    async fn started_runs(
        &self,
        graph_id: &GraphId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let log = self.log.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(log
            .iter()
            .rev()
            .filter(|r| matches!(r, HistoryRecord::RunStarted { .. }) && r.graph_id() == graph_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unfinished_runs(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        let log = self.log.read().map_err(|_| StorageError::LockPoisoned)?;
        let finished: HashSet<&RunId> = log
            .iter()
            .filter(|r| matches!(r, HistoryRecord::RunFinished { .. }))
            .map(|r| r.run_id())
            .collect();
        Ok(log
            .iter()
            .filter(|r| {
                matches!(r, HistoryRecord::RunStarted { .. }) && !finished.contains(r.run_id())
            })
            .cloned()
            .collect())
    }

    async fn acquire_lease(&self, lease: &RunLease) -> Result<LeaseGrant, StorageError> {
        let mut leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(current) = leases.get(&lease.graph_id) {
            if current.run_id != lease.run_id && current.is_live(Utc::now()) {
                return Ok(LeaseGrant::Held(current.clone()));
            }
        }
        leases.insert(lease.graph_id.clone(), lease.clone());
        Ok(LeaseGrant::Acquired)
    }

    async fn renew_lease(
        &self,
        graph_id: &GraphId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        match leases.get_mut(graph_id) {
            Some(lease) if lease.run_id == *run_id => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, graph_id: &GraphId, run_id: &RunId) -> Result<(), StorageError> {
        let mut leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        if leases.get(graph_id).map(|l| l.run_id == *run_id).unwrap_or(false) {
            leases.remove(graph_id);
        }
        Ok(())
    }

    async fn lease(&self, graph_id: &GraphId) -> Result<Option<RunLease>, StorageError> {
        let leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(leases.get(graph_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use chrono::Utc;

    fn started(graph: &str, run_id: RunId) -> HistoryRecord {
        HistoryRecord::RunStarted {
            graph_id: GraphId::new(graph),
            run_id,
            at: Utc::now(),
        }
    }

    fn finished(graph: &str, run_id: RunId, status: RunStatus) -> HistoryRecord {
        HistoryRecord::RunFinished {
            graph_id: GraphId::new(graph),
            run_id,
            status,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_started_runs_most_recent_first() {
        let storage = InMemoryStorage::new();
        let (a, b, c) = (RunId::new(), RunId::new(), RunId::new());
        storage.append(started("dvf", a)).await.unwrap();
        storage.append(started("other", b)).await.unwrap();
        storage.append(started("dvf", c)).await.unwrap();

        let runs = storage.started_runs(&GraphId::new("dvf"), 10).await.unwrap();
        let ids: Vec<RunId> = runs.iter().map(|r| *r.run_id()).collect();

        assert_eq!(ids, vec![c, a]);
        assert_eq!(storage.started_runs(&GraphId::new("dvf"), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_unfinished_interrupted() {
        let storage = InMemoryStorage::new();
        let (done, stale) = (RunId::new(), RunId::new());
        storage.append(started("dvf", done)).await.unwrap();
        storage
            .append(finished("dvf", done, RunStatus::Succeeded))
            .await
            .unwrap();
        storage.append(started("dvf", stale)).await.unwrap();

        let interrupted = storage.mark_unfinished_interrupted().await.unwrap();

        assert_eq!(interrupted, vec![stale]);
        assert_eq!(
            storage.run_summary(&stale).await.unwrap().status,
            RunStatus::Interrupted
        );
        assert!(storage.unfinished_runs().await.unwrap().is_empty());
        // Appended, never rewritten.
        assert_eq!(storage.len(), 4);
    }

    fn lease(run_id: RunId, ttl_secs: i64) -> RunLease {
        RunLease {
            graph_id: GraphId::new("dvf"),
            run_id,
            holder: format!("holder-{}", run_id),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_lease_held_until_released() {
        let storage = InMemoryStorage::new();
        let (first, second) = (RunId::new(), RunId::new());

        assert_eq!(
            storage.acquire_lease(&lease(first, 60)).await.unwrap(),
            LeaseGrant::Acquired
        );
        match storage.acquire_lease(&lease(second, 60)).await.unwrap() {
            LeaseGrant::Held(held) => assert_eq!(held.run_id, first),
            other => panic!("expected Held, got {:?}", other),
        }

        // Only the holder can release.
        storage.release_lease(&GraphId::new("dvf"), &second).await.unwrap();
        assert!(storage.lease(&GraphId::new("dvf")).await.unwrap().is_some());
        storage.release_lease(&GraphId::new("dvf"), &first).await.unwrap();

        assert_eq!(
            storage.acquire_lease(&lease(second, 60)).await.unwrap(),
            LeaseGrant::Acquired
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let storage = InMemoryStorage::new();
        let (crashed, next) = (RunId::new(), RunId::new());
        storage.acquire_lease(&lease(crashed, -5)).await.unwrap();

        let grant = storage.acquire_lease(&lease(next, 60)).await.unwrap();

        assert_eq!(grant, LeaseGrant::Acquired);
        let current = storage.lease(&GraphId::new("dvf")).await.unwrap().unwrap();
        assert_eq!(current.run_id, next);
        // The previous holder's renewal is refused.
        let renewed = storage
            .renew_lease(&GraphId::new("dvf"), &crashed, Utc::now())
            .await
            .unwrap();
        assert!(!renewed);
    }

    #[tokio::test]
    async fn test_leased_run_is_not_interrupted() {
        let storage = InMemoryStorage::new();
        let (live, crashed) = (RunId::new(), RunId::new());
        storage.append(started("dvf", crashed)).await.unwrap();
        storage.append(started("dvf", live)).await.unwrap();
        storage.acquire_lease(&lease(live, 60)).await.unwrap();

        let interrupted = storage.mark_unfinished_interrupted().await.unwrap();

        assert_eq!(interrupted, vec![crashed]);
        assert_eq!(
            storage.run_summary(&live).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let storage = InMemoryStorage::new();

        let result = storage.run_summary(&RunId::new()).await;

        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
