//! `PostgreSQL`-backed implementation of [`BookmarkStore`] and [`RunLedger`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. Callers inside a tokio runtime must reach it through
//! `spawn_blocking`.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls, Row};
use wmsync_types::run::SyncStatus;
use wmsync_types::state::{Bookmark, CursorValue, EntityName, RunId, RunStats};
use wmsync_types::validation::RejectedRecord;
use wmsync_types::wire::SyncMode;

use crate::backend::{BookmarkStore, RunLedger};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS wm_bookmarks (
    entity TEXT PRIMARY KEY,
    replication_key_value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wm_sync_runs (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    entities TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (now()::text),
    finished_at TEXT,
    records_processed BIGINT DEFAULT 0,
    records_rejected BIGINT DEFAULT 0,
    batches_committed BIGINT DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS wm_rejected_records (
    id BIGSERIAL PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES wm_sync_runs(run_id),
    entity TEXT NOT NULL,
    record_json TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    message TEXT NOT NULL,
    rejected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wm_rejected_run ON wm_rejected_records (run_id);
";

/// `PostgreSQL`-backed state storage.
///
/// Create with [`PostgresStateBackend::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=wms user=sync"`).
pub struct PostgresStateBackend {
    client: Mutex<Client>,
}

impl PostgresStateBackend {
    /// Connect to a `PostgreSQL` database and initialize state tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls)
            .map_err(|e| StateError::backend_context("connect", e))?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn row_to_bookmark(row: &Row) -> error::Result<Bookmark> {
        let entity: String = row.get(0);
        let raw_value: String = row.get(1);
        let raw_ts: String = row.get(2);
        let replication_key_value: CursorValue = serde_json::from_str(&raw_value)
            .map_err(|e| StateError::Corrupt(format!("cursor '{raw_value}': {e}")))?;
        let updated_at = DateTime::parse_from_rfc3339(&raw_ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StateError::Corrupt(format!("timestamp '{raw_ts}': {e}")))?;
        Ok(Bookmark {
            entity: EntityName::new(entity),
            replication_key_value,
            updated_at,
        })
    }
}

impl BookmarkStore for PostgresStateBackend {
    fn get_bookmark(&self, entity: &EntityName) -> error::Result<Option<Bookmark>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT entity, replication_key_value, updated_at \
                 FROM wm_bookmarks WHERE entity = $1",
                &[&entity.as_str()],
            )
            .map_err(|e| StateError::backend_context("get_bookmark", e))?;
        rows.first().map(Self::row_to_bookmark).transpose()
    }

    fn set_bookmark(&self, bookmark: &Bookmark) -> error::Result<()> {
        let value = serde_json::to_string(&bookmark.replication_key_value)?;
        let updated_at = bookmark.updated_at.to_rfc3339();
        let mut client = self.lock_client()?;
        client
            .execute(
                "INSERT INTO wm_bookmarks (entity, replication_key_value, updated_at) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (entity) \
                 DO UPDATE SET replication_key_value = $2, updated_at = $3",
                &[&bookmark.entity.as_str(), &value, &updated_at],
            )
            .map_err(|e| StateError::backend_context("set_bookmark", e))?;
        Ok(())
    }

    fn list_bookmarks(&self) -> error::Result<Vec<Bookmark>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT entity, replication_key_value, updated_at \
                 FROM wm_bookmarks ORDER BY entity",
                &[],
            )
            .map_err(|e| StateError::backend_context("list_bookmarks", e))?;
        rows.iter().map(Self::row_to_bookmark).collect()
    }

    fn delete_bookmark(&self, entity: &EntityName) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let n = client
            .execute(
                "DELETE FROM wm_bookmarks WHERE entity = $1",
                &[&entity.as_str()],
            )
            .map_err(|e| StateError::backend_context("delete_bookmark", e))?;
        Ok(n > 0)
    }
}

impl RunLedger for PostgresStateBackend {
    fn start_run(&self, run_id: RunId, mode: SyncMode, entities: &[EntityName]) -> error::Result<()> {
        let names = entities
            .iter()
            .map(EntityName::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let mut client = self.lock_client()?;
        client
            .execute(
                "INSERT INTO wm_sync_runs (run_id, mode, entities, status) VALUES ($1, $2, $3, $4)",
                &[
                    &run_id.to_string(),
                    &mode.as_str(),
                    &names,
                    &SyncStatus::Running.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: RunId, status: SyncStatus, stats: &RunStats) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "UPDATE wm_sync_runs SET status = $1, finished_at = now()::text, \
                 records_processed = $2, records_rejected = $3, batches_committed = $4, \
                 error_message = $5 WHERE run_id = $6",
                &[
                    &status.as_str(),
                    &(stats.records_processed as i64),
                    &(stats.records_rejected as i64),
                    &(stats.batches_committed as i64),
                    &stats.error_message,
                    &run_id.to_string(),
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

        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::backend_context("insert_rejected_records: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO wm_rejected_records \
                 (run_id, entity, record_json, rule_name, message, rejected_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .map_err(|e| StateError::backend_context("insert_rejected_records: prepare", e))?;

        let run = run_id.to_string();
        let mut count = 0u64;
        for record in records {
            tx.execute(
                &stmt,
                &[
                    &run,
                    &record.entity.as_str(),
                    &record.record_json,
                    &record.rule_name,
                    &record.message,
                    &record.rejected_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StateError::backend_context("insert_rejected_records: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_rejected_records: commit", e))?;

        Ok(count)
    }
}
