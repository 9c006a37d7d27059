//! SQLite storage implementation.
//!
//! Provides persistent run history using a SQLite database. Each record is
//! one row; the record itself is stored as JSON next to the indexed columns.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::{HistoryRecord, LeaseGrant, RunLease, Storage, StorageError};
use crate::core::types::{GraphId, RunId};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schemas = [
            include_str!("../../migrations/001_run_history.sql"),
            include_str!("../../migrations/002_run_leases.sql"),
        ];
        for schema in schemas {
            sqlx::raw_sql(schema)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        }
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode(rows: Vec<(String,)>) -> Result<Vec<HistoryRecord>, StorageError> {
    rows.into_iter()
        .map(|(payload,)| serde_json::from_str(&payload).map_err(StorageError::from))
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

type LeaseRow = (String, String, String, String);

fn decode_lease((graph_id, run_id, holder, expires_at): LeaseRow) -> Result<RunLease, StorageError> {
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|e| StorageError::SerializationError(format!("lease run id: {}", e)))?;
    let expires_at = DateTime::parse_from_rfc3339(&expires_at)
        .map_err(|e| StorageError::SerializationError(format!("lease expiry: {}", e)))?
        .with_timezone(&Utc);
    Ok(RunLease {
        graph_id: GraphId::new(graph_id),
        run_id: RunId::from_uuid(run_id),
        holder,
        expires_at,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn append(&self, record: HistoryRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&record)?;
        sqlx::query(
            r#"
            INSERT INTO run_history (graph_id, run_id, kind, recorded_at, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.graph_id().as_str())
        .bind(record.run_id().to_string())
        .bind(record.kind())
        .bind(record.at().to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn records(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM run_history WHERE run_id = ? ORDER BY seq")
                .bind(run_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;
        decode(rows)
    }

    async fn started_runs(
        &self,
        graph_id: &GraphId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM run_history
            WHERE graph_id = ? AND kind = 'run_started'
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(graph_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        decode(rows)
    }

    async fn unfinished_runs(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.payload FROM run_history s
            WHERE s.kind = 'run_started'
              AND NOT EXISTS (
                SELECT 1 FROM run_history f
                WHERE f.run_id = s.run_id AND f.kind = 'run_finished'
              )
            ORDER BY s.seq
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        decode(rows)
    }

    async fn acquire_lease(&self, lease: &RunLease) -> Result<LeaseGrant, StorageError> {
        // A conflicting row is only overwritten when it belongs to the same
        // run or has expired; either way the statement is atomic.
        let result = sqlx::query(
            r#"
            INSERT INTO run_leases (graph_id, run_id, holder, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(graph_id) DO UPDATE SET
                run_id = excluded.run_id,
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE run_leases.run_id = excluded.run_id OR run_leases.expires_at <= ?
            "#,
        )
        .bind(lease.graph_id.as_str())
        .bind(lease.run_id.to_string())
        .bind(&lease.holder)
        .bind(timestamp(lease.expires_at))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(LeaseGrant::Acquired);
        }
        match self.lease(&lease.graph_id).await? {
            Some(held) => Ok(LeaseGrant::Held(held)),
            None => Err(StorageError::Other(format!(
                "lease on {} neither acquired nor held",
                lease.graph_id
            ))),
        }
    }

    async fn renew_lease(
        &self,
        graph_id: &GraphId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE run_leases SET expires_at = ? WHERE graph_id = ? AND run_id = ?")
                .bind(timestamp(expires_at))
                .bind(graph_id.as_str())
                .bind(run_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, graph_id: &GraphId, run_id: &RunId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM run_leases WHERE graph_id = ? AND run_id = ?")
            .bind(graph_id.as_str())
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn lease(&self, graph_id: &GraphId) -> Result<Option<RunLease>, StorageError> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT graph_id, run_id, holder, expires_at FROM run_leases WHERE graph_id = ?",
        )
        .bind(graph_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        row.map(decode_lease).transpose()
    }
}
