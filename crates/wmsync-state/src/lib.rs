//! Bookmark persistence and run history for wmsync.
//!
//! Provides the [`BookmarkStore`] and [`RunLedger`] traits with a
//! JSON-file store, a [`SqliteStateBackend`] and a
//! [`PostgresStateBackend`].

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod file;
pub mod postgres;
pub mod sqlite;

pub use backend::{BookmarkStore, RunLedger};
pub use error::StateError;
pub use file::JsonFileBookmarkStore;
pub use postgres::PostgresStateBackend;
pub use sqlite::SqliteStateBackend;
