//! SQLite-based checkpoint store
//!
//! Stores checkpoint blobs in a SQLite database. Supports both file-based
//! and in-memory databases.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS checkpoints (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     run_id TEXT NOT NULL,
//!     sequence INTEGER NOT NULL,
//!     data BLOB NOT NULL,
//!     created_at TEXT NOT NULL,
//!     UNIQUE(run_id, sequence)
//! );
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio_rusqlite::Connection;

use super::{CheckpointInfo, CheckpointStore};
use crate::error::WorkflowError;

/// SQLite-based checkpoint store.
///
/// Uses SQLite's ACID guarantees for reliable checkpoint storage.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Connection>,
}

impl SqliteCheckpointStore {
    /// Open (or create) a store at `path`, or `:memory:` for an in-memory database
    pub async fn new(path: impl AsRef<str>) -> Result<Self, WorkflowError> {
        let path = path.as_ref().to_string();

        let conn = Connection::open(&path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to open SQLite: {}", e)))?;

        conn.call(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, sequence)
                );
                CREATE INDEX IF NOT EXISTS idx_run_sequence
                    ON checkpoints(run_id, sequence);
                "#,
            )?;
            Ok(())
        })
        .await
        .map_err(|e| WorkflowError::checkpoint(format!("Failed to create schema: {}", e)))?;

        Ok(Self { conn: Arc::new(conn) })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, info: &CheckpointInfo, data: Vec<u8>) -> Result<(), WorkflowError> {
        let run_id = info.run_id.clone();
        let sequence = info.sequence as i64;
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO checkpoints (run_id, sequence, data, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    rusqlite::params![run_id, sequence, data, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to save checkpoint: {}", e)))
    }

    async fn get(&self, info: &CheckpointInfo) -> Result<Option<Vec<u8>>, WorkflowError> {
        let run_id = info.run_id.clone();
        let sequence = info.sequence as i64;

        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM checkpoints WHERE run_id = ?1 AND sequence = ?2")?;
                let mut rows = stmt.query(rusqlite::params![run_id, sequence])?;

                if let Some(row) = rows.next()? {
                    let data: Vec<u8> = row.get(0)?;
                    Ok(Some(data))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to load checkpoint: {}", e)))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, WorkflowError> {
        let owned_run_id = run_id.to_string();

        let sequences = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT sequence FROM checkpoints WHERE run_id = ?1 ORDER BY sequence ASC")?;
                let rows = stmt.query_map(rusqlite::params![owned_run_id], |row| {
                    let sequence: i64 = row.get(0)?;
                    Ok(sequence as u64)
                })?;

                let mut sequences = Vec::new();
                for row in rows {
                    sequences.push(row?);
                }
                Ok(sequences)
            })
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to list checkpoints: {}", e)))?;

        Ok(sequences
            .into_iter()
            .map(|sequence| CheckpointInfo::new(run_id, sequence))
            .collect())
    }

    async fn delete(&self, info: &CheckpointInfo) -> Result<(), WorkflowError> {
        let run_id = info.run_id.clone();
        let sequence = info.sequence as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM checkpoints WHERE run_id = ?1 AND sequence = ?2",
                    rusqlite::params![run_id, sequence],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to delete checkpoint: {}", e)))
    }
}
