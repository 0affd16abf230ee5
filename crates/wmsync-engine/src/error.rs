//! Error model for the sync core and retry backoff policy helpers.
//!
//! Every component returns a closed set of variants; only the orchestrator
//! decides whether an error is run-fatal.

use std::time::Duration;

use wmsync_types::run::SyncRun;

// ---------------------------------------------------------------------------
// ConfigurationError: fatal, raised before any external call
// ---------------------------------------------------------------------------

/// Semantic configuration problems, all collected in one pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

impl ConfigurationError {
    /// Single-problem shorthand.
    pub fn single(message: impl Into<String>) -> Self {
        Self::Invalid(vec![message.into()])
    }

    #[must_use]
    pub fn problems(&self) -> &[String] {
        match self {
            Self::Invalid(problems) => problems,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionError / PoolError
// ---------------------------------------------------------------------------

/// Failure talking to the target database.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Worth retrying: timeouts, resets, transient unavailability.
    #[error("transient connection error: {0}")]
    Transient(String),
    /// The connection (or the server) cannot be used any more.
    #[error("fatal connection error: {0}")]
    Fatal(String),
    /// The statement was refused for its data; the connection is still usable.
    #[error("rejected by target: {0}")]
    Rejected(String),
}

impl ConnectionError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the failure says anything about the connection itself.
    #[must_use]
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Errors surfaced by [`ConnectionPool::lease`](crate::pool::ConnectionPool::lease).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every slot (pool + overflow) stayed busy for the whole lease timeout.
    #[error("connection pool exhausted: no slot freed within {timeout:?}")]
    Exhausted { timeout: Duration },
    /// No replacement connection could be opened.
    #[error("connection pool unavailable: {0}")]
    Unavailable(ConnectionError),
    /// Opening a connection kept failing transiently after all retries.
    #[error("connection pool retries exhausted: {0}")]
    Transient(ConnectionError),
    /// The caller's cancellation signal fired while waiting.
    #[error("lease cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// PipelineExecutionError
// ---------------------------------------------------------------------------

/// External extractor process or stream failure. Always run-fatal.
#[derive(Debug, thiserror::Error)]
pub enum PipelineExecutionError {
    #[error("failed to start extractor '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extractor i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor exited with {status}")]
    ProcessFailed { status: String },
    #[error("extractor protocol error: {0}")]
    Protocol(String),
    #[error("extractor stream ended without a STATE message")]
    MissingState,
    #[error("failed to write extractor request: {0}")]
    Request(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// AlertDeliveryError: always swallowed by the dispatcher
// ---------------------------------------------------------------------------

/// One channel failed to deliver one alert.
#[derive(Debug, thiserror::Error)]
pub enum AlertDeliveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint answered {status}")]
    Status { status: u16 },
    #[error("channel '{channel}' failed: {message}")]
    Channel { channel: String, message: String },
}

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Another run holds a lock on an overlapping entity set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a sync run is already active for overlapping entities [{held}]")]
pub struct AlreadyRunning {
    /// Comma-joined entity set of the run holding the lock.
    pub held: String,
}

/// Outcome of [`SyncOrchestrator::run`](crate::orchestrator::SyncOrchestrator::run)
/// when it does not complete.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),
    /// The run started and reached `FAILED`. Carries the final run record
    /// (last good bookmarks, rejection ratio, correlation id).
    #[error("sync run {} failed: {}", .run.run_id, failure_summary(.run))]
    RunFailed { run: Box<SyncRun> },
}

impl OrchestratorError {
    /// The failed run, when the run got far enough to have one.
    #[must_use]
    pub fn run(&self) -> Option<&SyncRun> {
        match self {
            Self::RunFailed { run } => Some(run),
            _ => None,
        }
    }
}

fn failure_summary(run: &SyncRun) -> String {
    run.failure.as_ref().map_or_else(
        || "unknown cause".to_string(),
        |f| format!("{} ({})", f.message, f.kind),
    )
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * multiplier^attempt`, capped at `max_wait`.
///
/// `attempt` starts at 0 for the first retry.
#[must_use]
pub fn compute_backoff(base: Duration, multiplier: f64, attempt: u32, max_wait: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let factor = multiplier.max(1.0).powi(exponent);
    let delay_secs = base.as_secs_f64() * factor;
    if !delay_secs.is_finite() || delay_secs >= max_wait.as_secs_f64() {
        return max_wait;
    }
    Duration::from_secs_f64(delay_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use wmsync_types::run::FailureKind;
    use wmsync_types::state::EntityName;
    use wmsync_types::wire::SyncMode;

    // -----------------------------------------------------------------------
    // compute_backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_grows_by_multiplier() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        assert_eq!(compute_backoff(base, 2.0, 0, max), Duration::from_millis(100));
        assert_eq!(compute_backoff(base, 2.0, 1, max), Duration::from_millis(200));
        assert_eq!(compute_backoff(base, 2.0, 3, max), Duration::from_millis(800));
    }

    #[test]
    fn backoff_capped_at_max_wait() {
        let max = Duration::from_secs(5);
        assert_eq!(
            compute_backoff(Duration::from_millis(100), 2.0, 30, max),
            max
        );
        assert_eq!(
            compute_backoff(Duration::from_millis(100), 10.0, u32::MAX, max),
            max
        );
    }

    #[test]
    fn backoff_multiplier_below_one_is_constant() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(5);
        assert_eq!(compute_backoff(base, 0.5, 4, max), base);
    }

    // -----------------------------------------------------------------------
    // Display
    // -----------------------------------------------------------------------

    #[test]
    fn configuration_error_lists_every_problem() {
        let err = ConfigurationError::Invalid(vec!["a is bad".into(), "b is bad".into()]);
        let msg = err.to_string();
        assert!(msg.contains("a is bad"));
        assert!(msg.contains("b is bad"));
        assert_eq!(err.problems().len(), 2);
    }

    #[test]
    fn run_failed_display_names_cause() {
        let mut run = SyncRun::new(
            SyncMode::Incremental,
            BTreeSet::from([EntityName::new("orders")]),
        );
        run.fail(FailureKind::RejectionThreshold, "rejection ratio 0.10 > 0.05");
        let err = OrchestratorError::RunFailed { run: Box::new(run) };
        let msg = err.to_string();
        assert!(msg.contains("rejection ratio 0.10 > 0.05"));
        assert!(msg.contains("rejection_threshold"));
        assert!(err.run().is_some());
    }

    #[test]
    fn connection_error_transience() {
        assert!(ConnectionError::Transient("reset".into()).is_transient());
        assert!(!ConnectionError::Fatal("auth".into()).is_transient());
    }
}
