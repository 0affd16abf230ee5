pub mod bookmarks;
pub mod check;
pub mod reset;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use wmsync_engine::config::parser::parse_config;
use wmsync_engine::config::validator::validate_config;
use wmsync_engine::config::{StateBackendKind, StateConfig, SyncConfig};
use wmsync_state::{
    BookmarkStore, JsonFileBookmarkStore, PostgresStateBackend, RunLedger, SqliteStateBackend,
};

/// Parse and validate a sync config file.
pub(crate) fn load_config(path: &Path) -> Result<SyncConfig> {
    let config = parse_config(path)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Bookmark store plus the run ledger when the backend keeps one.
pub(crate) struct StateHandles {
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub ledger: Option<Arc<dyn RunLedger>>,
}

/// Open the configured state backend. Blocks; call through
/// [`open_state_blocking`] from async code.
pub(crate) fn open_state(config: &StateConfig) -> Result<StateHandles> {
    match config.backend {
        StateBackendKind::File => {
            let path = config.resolved_path();
            let store = JsonFileBookmarkStore::open(path.clone())
                .with_context(|| format!("Failed to open bookmark file: {}", path.display()))?;
            Ok(StateHandles {
                bookmarks: Arc::new(store),
                ledger: None,
            })
        }
        StateBackendKind::Sqlite => {
            let path = config.resolved_path();
            let backend = Arc::new(
                SqliteStateBackend::open(&path)
                    .with_context(|| format!("Failed to open state db: {}", path.display()))?,
            );
            Ok(StateHandles {
                bookmarks: backend.clone(),
                ledger: Some(backend),
            })
        }
        StateBackendKind::Postgres => {
            let connstr = config
                .connection
                .as_deref()
                .context("state.connection is required for the postgres backend")?;
            let backend = Arc::new(
                PostgresStateBackend::open(connstr).context("Failed to open postgres state")?,
            );
            Ok(StateHandles {
                bookmarks: backend.clone(),
                ledger: Some(backend),
            })
        }
    }
}

pub(crate) async fn open_state_blocking(config: StateConfig) -> Result<StateHandles> {
    tokio::task::spawn_blocking(move || open_state(&config)).await?
}

impl StateHandles {
    /// Drop the handles on the blocking pool; database clients block on close.
    pub(crate) async fn close(self) {
        if let Err(err) = tokio::task::spawn_blocking(move || drop(self)).await {
            tracing::warn!(error = %err, "State backend close panicked");
        }
    }
}
