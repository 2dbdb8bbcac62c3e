//! Typed query helpers for the import-state tables.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{BatchStatus, ImportOperation, ImportSnapshot, PendingImport};

/// `kv_state` key holding the next transfer job id.
pub const NEXT_TRANSFER_ID_KEY: &str = "next_transfer_id";

/// A row from the `batch_history` table.
#[derive(Debug, Clone)]
pub struct BatchHistoryEntry {
    pub id: i64,
    pub batch_id: String,
    pub status: String,
    pub asset_count: i64,
    pub placed_count: i64,
    pub details: Option<String>,
    pub finished_at: String,
}

// -- kv_state ---------------------------------------------------------------

fn read_state(conn: &Connection, key: &str) -> Result<Option<String>, DatabaseError> {
    let value = conn
        .query_row(
            "SELECT value FROM kv_state WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Upsert one key-value state entry.
fn write_state(conn: &Connection, key: &str, value: &str, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    debug!(key, value, "set kv_state");
    Ok(())
}

impl Database {
    // -- snapshot -----------------------------------------------------------

    /// Replace all persisted import state with `snapshot` in one transaction.
    pub fn save_snapshot(&self, snapshot: &ImportSnapshot) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            conn.execute("DELETE FROM import_operations", [])?;
            conn.execute("DELETE FROM pending_imports", [])?;

            for op in &snapshot.operations {
                let payload = serde_json::to_string(op)?;
                conn.execute(
                    "INSERT INTO import_operations (asset_key, batch_id, status, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![op.asset.key(), op.batch_id, op.status.to_string(), payload, now],
                )?;
            }
            for pending in &snapshot.pending {
                let payload = serde_json::to_string(pending)?;
                conn.execute(
                    "INSERT INTO pending_imports (asset_key, batch_id, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![pending.asset.key(), pending.batch_id, payload, now],
                )?;
            }
            write_state(conn, NEXT_TRANSFER_ID_KEY, &snapshot.next_transfer_id.to_string(), &now)?;
            Ok(())
        })?;
        debug!(
            operations = snapshot.operations.len(),
            pending = snapshot.pending.len(),
            "saved import snapshot"
        );
        Ok(())
    }

    /// Load the persisted import state. An empty database yields an empty
    /// snapshot.
    pub fn load_snapshot(&self) -> Result<ImportSnapshot, DatabaseError> {
        let conn = self.conn();

        let mut stmt = conn.prepare("SELECT payload FROM import_operations ORDER BY asset_key")?;
        let operations = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|payload| serde_json::from_str::<ImportOperation>(payload))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT payload FROM pending_imports ORDER BY created_at, asset_key")?;
        let pending = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|payload| serde_json::from_str::<PendingImport>(payload))
            .collect::<Result<Vec<_>, _>>()?;

        let next_transfer_id: u64 = read_state(&conn, NEXT_TRANSFER_ID_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Ok(ImportSnapshot {
            operations,
            pending,
            next_transfer_id,
        })
    }

    // -- batch_history ------------------------------------------------------

    /// Record a finalized batch.
    pub fn insert_batch_history(
        &self,
        batch_id: &str,
        status: BatchStatus,
        asset_count: usize,
        placed_count: usize,
        details: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO batch_history (batch_id, status, asset_count, placed_count, details, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch_id,
                status.to_string(),
                asset_count as i64,
                placed_count as i64,
                details,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, batch_id, %status, "recorded batch history");
        Ok(id)
    }

    /// Most recent finalized batches, newest first.
    pub fn list_batch_history(&self, limit: u32) -> Result<Vec<BatchHistoryEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, status, asset_count, placed_count, details, finished_at
             FROM batch_history ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(BatchHistoryEntry {
                    id: row.get(0)?,
                    batch_id: row.get(1)?,
                    status: row.get(2)?,
                    asset_count: row.get(3)?,
                    placed_count: row.get(4)?,
                    details: row.get(5)?,
                    finished_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetIdentifier, ImportStatus, TransferId, TransferJob, TransferStatus};
    use std::path::PathBuf;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_operation() -> ImportOperation {
        let asset = AssetIdentifier::new("acme", "props", "chair", "3");
        let mut job = TransferJob::new(TransferId(7), "https://cdn/chair.fbx", "/tmp/dl/chair.fbx")
            .with_total_bytes(2048);
        job.status = TransferStatus::InProgress;
        job.progress = 0.25;
        ImportOperation {
            asset,
            name: "Chair".into(),
            destination_path: PathBuf::from("/proj/Assets/Chair"),
            staging_path: PathBuf::from("/tmp/dl"),
            started_at: Utc::now(),
            status: ImportStatus::InProgress,
            error: None,
            batch_id: "b1".into(),
            stash: None,
            fingerprint: Some("etag-1".into()),
            jobs: vec![job],
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let db = setup_db();
        let snapshot = db.load_snapshot().unwrap();
        assert!(snapshot.operations.is_empty());
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.next_transfer_id, 1);
    }

    #[test]
    fn test_snapshot_replaces_previous_state() {
        let db = setup_db();
        let op = sample_operation();
        let pending = PendingImport {
            asset: op.asset.clone(),
            name: op.name.clone(),
            batch_id: op.batch_id.clone(),
        };
        db.save_snapshot(&ImportSnapshot {
            operations: vec![op.clone()],
            pending: vec![pending.clone()],
            next_transfer_id: 8,
        })
        .unwrap();

        let loaded = db.load_snapshot().unwrap();
        assert_eq!(loaded.operations, vec![op]);
        assert_eq!(loaded.pending, vec![pending]);
        assert_eq!(loaded.next_transfer_id, 8);

        db.save_snapshot(&ImportSnapshot {
            next_transfer_id: 9,
            ..ImportSnapshot::default()
        })
        .unwrap();
        let loaded = db.load_snapshot().unwrap();
        assert!(loaded.operations.is_empty());
        assert_eq!(loaded.next_transfer_id, 9);
    }

    #[test]
    fn test_kv_state_upserts() {
        let db = setup_db();
        let conn = db.conn();
        assert!(read_state(&conn, NEXT_TRANSFER_ID_KEY).unwrap().is_none());
        write_state(&conn, NEXT_TRANSFER_ID_KEY, "3", "2026-01-01T00:00:00Z").unwrap();
        write_state(&conn, NEXT_TRANSFER_ID_KEY, "4", "2026-01-02T00:00:00Z").unwrap();
        assert_eq!(read_state(&conn, NEXT_TRANSFER_ID_KEY).unwrap().as_deref(), Some("4"));
    }

    #[test]
    fn test_unparsable_transfer_id_falls_back_to_one() {
        let db = setup_db();
        write_state(&db.conn(), NEXT_TRANSFER_ID_KEY, "garbage", "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(db.load_snapshot().unwrap().next_transfer_id, 1);
    }

    #[test]
    fn test_batch_history() {
        let db = setup_db();
        db.insert_batch_history("b1", BatchStatus::Success, 2, 5, None).unwrap();
        db.insert_batch_history("b2", BatchStatus::Error, 1, 0, Some("timeout")).unwrap();
        let entries = db.list_batch_history(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].batch_id, "b2");
        assert_eq!(entries[0].status, "error");
    }
}
