//! Sync run lifecycle model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Bookmark, CorrelationId, EntityName, RunId};
use crate::wire::SyncMode;

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Starting,
    Running,
    Validating,
    Committing,
    Completed,
    Failed,
}

impl SyncStatus {
    /// Storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SyncStatus::{Committing, Completed, Failed, Running, Starting, Validating};
        match self {
            Starting => matches!(next, Running | Failed),
            Running => matches!(next, Validating | Completed | Failed),
            Validating => matches!(next, Committing | Running | Failed),
            Committing => matches!(next, Running | Validating | Failed),
            Completed | Failed => false,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RejectionThreshold,
    Pipeline,
    Connection,
    Commit,
    Bookmark,
    TotalTimeout,
    RequestTimeout,
    Cancelled,
    /// A worker task panicked.
    Internal,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RejectionThreshold => "rejection_threshold",
            Self::Pipeline => "pipeline",
            Self::Connection => "connection",
            Self::Commit => "commit",
            Self::Bookmark => "bookmark",
            Self::TotalTimeout => "total_timeout",
            Self::RequestTimeout => "request_timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// SyncRun
// ---------------------------------------------------------------------------

/// One orchestrated sync over a set of entities.
///
/// Mutated only by the orchestrator; terminal once `status` is
/// `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
    pub mode: SyncMode,
    pub entities: BTreeSet<EntityName>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub records_processed: u64,
    pub records_rejected: u64,
    pub batches_committed: u64,
    /// Last successfully advanced bookmark per entity.
    pub bookmarks: BTreeMap<EntityName, Bookmark>,
    pub failure: Option<RunFailure>,
}

impl SyncRun {
    #[must_use]
    pub fn new(mode: SyncMode, entities: BTreeSet<EntityName>) -> Self {
        let run_id = RunId::generate();
        Self {
            run_id,
            correlation_id: CorrelationId::for_run(run_id),
            mode,
            entities,
            started_at: Utc::now(),
            ended_at: None,
            status: SyncStatus::Starting,
            records_processed: 0,
            records_rejected: 0,
            batches_committed: 0,
            bookmarks: BTreeMap::new(),
            failure: None,
        }
    }

    /// Move to `next` if the transition is legal. Returns whether it was applied.
    pub fn transition(&mut self, next: SyncStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                run_id = %self.run_id,
                from = %self.status,
                to = %next,
                "Illegal run status transition refused"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    /// Terminate the run as failed, keeping the first recorded cause.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(RunFailure {
                kind,
                message: message.into(),
            });
        }
        self.transition(SyncStatus::Failed);
    }

    /// Aggregate `rejected / processed`; 0 when nothing was processed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_ratio(&self) -> f64 {
        if self.records_processed == 0 {
            0.0
        } else {
            self.records_rejected as f64 / self.records_processed as f64
        }
    }

    /// Wall-clock duration so far (or total, once terminal).
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// Lock name: the sorted entity set joined with commas.
    #[must_use]
    pub fn entity_set_key(&self) -> String {
        self.entities
            .iter()
            .map(EntityName::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(names: &[&str]) -> BTreeSet<EntityName> {
        names.iter().map(|n| EntityName::new(*n)).collect()
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut run = SyncRun::new(SyncMode::Full, entities(&["orders"]));
        assert!(run.transition(SyncStatus::Running));
        assert!(run.transition(SyncStatus::Validating));
        assert!(run.transition(SyncStatus::Committing));
        assert!(run.transition(SyncStatus::Running));
        assert!(run.transition(SyncStatus::Completed));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut run = SyncRun::new(SyncMode::Full, entities(&["orders"]));
        run.fail(FailureKind::Pipeline, "boom");
        assert_eq!(run.status, SyncStatus::Failed);
        assert!(!run.transition(SyncStatus::Running));
        assert_eq!(run.status, SyncStatus::Failed);
    }

    #[test]
    fn starting_cannot_skip_to_committing() {
        let mut run = SyncRun::new(SyncMode::Incremental, entities(&["orders"]));
        assert!(!run.transition(SyncStatus::Committing));
        assert_eq!(run.status, SyncStatus::Starting);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn refused_transition_is_logged_at_warn() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut run = SyncRun::new(SyncMode::Incremental, entities(&["orders"]));
        let applied = tracing::subscriber::with_default(subscriber, || {
            run.transition(SyncStatus::Committing)
        });

        assert!(!applied);
        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("WARN"));
        assert!(logged.contains("Illegal run status transition refused"));
        assert!(logged.contains(&run.run_id.to_string()));
    }

    #[test]
    fn first_failure_cause_wins() {
        let mut run = SyncRun::new(SyncMode::Full, entities(&["orders"]));
        run.fail(FailureKind::TotalTimeout, "deadline");
        run.fail(FailureKind::Commit, "later");
        assert_eq!(run.failure.as_ref().unwrap().kind, FailureKind::TotalTimeout);
    }

    #[test]
    fn entity_set_key_is_sorted() {
        let run = SyncRun::new(SyncMode::Full, entities(&["stock", "orders", "items"]));
        assert_eq!(run.entity_set_key(), "items,orders,stock");
    }

    #[test]
    fn rejection_ratio_handles_zero() {
        let mut run = SyncRun::new(SyncMode::Full, entities(&["orders"]));
        assert!(run.rejection_ratio().abs() < f64::EPSILON);
        run.records_processed = 200;
        run.records_rejected = 5;
        assert!((run.rejection_ratio() - 0.025).abs() < 1e-9);
    }
}
