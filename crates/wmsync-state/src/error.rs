//! State backend error types.

/// Errors produced by [`BookmarkStore`](crate::BookmarkStore) and
/// [`RunLedger`](crate::RunLedger) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Database driver failure, with the operation that hit it.
    #[error("state backend error ({context}): {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// File-system I/O failure (e.g. creating the state directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bookmark file could not be encoded or decoded.
    #[error("bookmark file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    /// Stored value could not be interpreted.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap a driver error without extra context.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "query",
            source: Box::new(err),
        }
    }

    /// Wrap a driver error, naming the failing operation.
    pub fn backend_context(
        context: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context,
            source: Box::new(err),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::backend_context("set_bookmark", inner);
        let msg = err.to_string();
        assert!(msg.contains("set_bookmark"), "got: {msg}");
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "state backend lock poisoned");
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }
}
