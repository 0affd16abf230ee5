//! `SQLite`-backed implementation of [`BookmarkStore`] and [`RunLedger`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use wmsync_types::run::SyncStatus;
use wmsync_types::state::{Bookmark, CursorValue, EntityName, RunId, RunStats};
use wmsync_types::validation::RejectedRecord;
use wmsync_types::wire::SyncMode;

use crate::backend::{BookmarkStore, RunLedger};
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS bookmarks (
    entity TEXT PRIMARY KEY,
    replication_key_value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    entities TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_processed INTEGER DEFAULT 0,
    records_rejected INTEGER DEFAULT 0,
    batches_committed INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS rejected_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES sync_runs(run_id),
    entity TEXT NOT NULL,
    record_json TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    message TEXT NOT NULL,
    rejected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rejected_run ON rejected_records (run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn to_sqlite(ts: &DateTime<Utc>) -> String {
        ts.format(SQLITE_DATETIME_FMT).to_string()
    }

    fn from_sqlite(raw: &str) -> error::Result<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT)
            .map(|ndt| ndt.and_utc())
            .map_err(|e| StateError::Corrupt(format!("timestamp '{raw}': {e}")))
    }

    fn decode_cursor(raw: &str) -> error::Result<CursorValue> {
        serde_json::from_str(raw).map_err(|e| StateError::Corrupt(format!("cursor '{raw}': {e}")))
    }

    fn row_to_bookmark(entity: String, raw_value: &str, raw_ts: &str) -> error::Result<Bookmark> {
        Ok(Bookmark {
            entity: EntityName::new(entity),
            replication_key_value: Self::decode_cursor(raw_value)?,
            updated_at: Self::from_sqlite(raw_ts)?,
        })
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: RunId) -> error::Result<(String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, records_processed, finished_at, error_message FROM sync_runs WHERE run_id = ?1",
            [run_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::backend)
    }

    #[cfg(test)]
    fn count_rejected_for_run(&self, run_id: RunId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM rejected_records WHERE run_id = ?1",
            [run_id.to_string()],
            |row| row.get(0),
        )
        .map_err(StateError::backend)
    }
}

impl BookmarkStore for SqliteStateBackend {
    fn get_bookmark(&self, entity: &EntityName) -> error::Result<Option<Bookmark>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT replication_key_value, updated_at FROM bookmarks WHERE entity = ?1",
                [entity.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_bookmark", e))?;

        row.map(|(value, ts)| Self::row_to_bookmark(entity.as_str().to_string(), &value, &ts))
            .transpose()
    }

    fn set_bookmark(&self, bookmark: &Bookmark) -> error::Result<()> {
        let value = serde_json::to_string(&bookmark.replication_key_value)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO bookmarks (entity, replication_key_value, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(entity) \
             DO UPDATE SET replication_key_value = ?2, updated_at = ?3",
            rusqlite::params![
                bookmark.entity.as_str(),
                value,
                Self::to_sqlite(&bookmark.updated_at),
            ],
        )
        .map_err(|e| StateError::backend_context("set_bookmark", e))?;
        Ok(())
    }

    fn list_bookmarks(&self) -> error::Result<Vec<Bookmark>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT entity, replication_key_value, updated_at FROM bookmarks ORDER BY entity",
            )
            .map_err(|e| StateError::backend_context("list_bookmarks: prepare", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_bookmarks: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (entity, value, ts) =
                row.map_err(|e| StateError::backend_context("list_bookmarks: row", e))?;
            out.push(Self::row_to_bookmark(entity, &value, &ts)?);
        }
        Ok(out)
    }

    fn delete_bookmark(&self, entity: &EntityName) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let n = conn
            .execute("DELETE FROM bookmarks WHERE entity = ?1", [entity.as_str()])
            .map_err(|e| StateError::backend_context("delete_bookmark", e))?;
        Ok(n > 0)
    }
}

impl RunLedger for SqliteStateBackend {
    fn start_run(&self, run_id: RunId, mode: SyncMode, entities: &[EntityName]) -> error::Result<()> {
        let names = entities
            .iter()
            .map(EntityName::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_runs (run_id, mode, entities, status) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                run_id.to_string(),
                mode.as_str(),
                names,
                SyncStatus::Running.as_str()
            ],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: RunId, status: SyncStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_runs SET status = ?1, finished_at = datetime('now'), \
             records_processed = ?2, records_rejected = ?3, batches_committed = ?4, \
             error_message = ?5 WHERE run_id = ?6",
            rusqlite::params![
                status.as_str(),
                stats.records_processed as i64,
                stats.records_rejected as i64,
                stats.batches_committed as i64,
                stats.error_message,
                run_id.to_string(),
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    fn insert_rejected_records(
        &self,
        run_id: RunId,
        records: &[RejectedRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_rejected_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO rejected_records \
                 (run_id, entity, record_json, rule_name, message, rejected_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(|e| StateError::backend_context("insert_rejected_records: prepare", e))?;

        let run = run_id.to_string();
        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                run,
                record.entity.as_str(),
                record.record_json,
                record.rule_name,
                record.message,
                record.rejected_at.to_rfc3339(),
            ])
            .map_err(|e| StateError::backend_context("insert_rejected_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_rejected_records: commit", e))?;

        Ok(count)
    }
}
