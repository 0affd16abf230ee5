//! Storage contracts.
//!
//! [`BookmarkStore`] persists one replication cursor per entity.
//! [`RunLedger`] records run history and rejected records. Model types live
//! in [`wmsync_types`].

use wmsync_types::run::SyncStatus;
use wmsync_types::state::{Bookmark, EntityName, RunId, RunStats};
use wmsync_types::validation::RejectedRecord;
use wmsync_types::wire::SyncMode;

use crate::error;

/// Per-entity replication cursor storage.
///
/// Writes are last-writer-wins per entity. Implementations must be
/// `Send + Sync` for use behind `Arc<dyn BookmarkStore>`.
pub trait BookmarkStore: Send + Sync {
    /// Read the bookmark for `entity`.
    ///
    /// Returns `Ok(None)` when nothing has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_bookmark(&self, entity: &EntityName) -> error::Result<Option<Bookmark>>;

    /// Overwrite the bookmark for `bookmark.entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure;
    /// the previously stored bookmark must then still be intact.
    fn set_bookmark(&self, bookmark: &Bookmark) -> error::Result<()>;

    /// All stored bookmarks, sorted by entity.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_bookmarks(&self) -> error::Result<Vec<Bookmark>>;

    /// Remove the bookmark for `entity`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn delete_bookmark(&self, entity: &EntityName) -> error::Result<bool>;
}

/// Run history and dead-letter storage.
pub trait RunLedger: Send + Sync {
    /// Record the start of a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, run_id: RunId, mode: SyncMode, entities: &[EntityName])
        -> error::Result<()>;

    /// Finalize a run with its terminal status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: RunId, status: SyncStatus, stats: &RunStats)
        -> error::Result<()>;

    /// Persist rejected records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_rejected_records(
        &self,
        run_id: RunId,
        records: &[RejectedRecord],
    ) -> error::Result<u64>;
}
