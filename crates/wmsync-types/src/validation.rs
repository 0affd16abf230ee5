//! Validation outcome types produced once per batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::BatchRef;
use crate::state::EntityName;

/// Whether a finding rejects its record or only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warn,
    Reject,
}

/// One validation finding. `record_ref` is the record index within the
/// batch, or `None` for batch-level findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub record_ref: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub rule_name: String,
    pub message: String,
    pub severity: IssueSeverity,
}

impl ValidationError {
    #[must_use]
    pub fn record(
        index: usize,
        field: Option<&str>,
        rule_name: impl Into<String>,
        message: impl Into<String>,
        severity: IssueSeverity,
    ) -> Self {
        Self {
            record_ref: Some(index),
            field: field.map(str::to_string),
            rule_name: rule_name.into(),
            message: message.into(),
            severity,
        }
    }

    #[must_use]
    pub fn batch(
        rule_name: impl Into<String>,
        message: impl Into<String>,
        severity: IssueSeverity,
    ) -> Self {
        Self {
            record_ref: None,
            field: None,
            rule_name: rule_name.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Per-layer pass scores in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerScores {
    pub schema: f64,
    pub business: f64,
    pub quality: f64,
    pub referential: f64,
}

impl Default for LayerScores {
    fn default() -> Self {
        Self {
            schema: 1.0,
            business: 1.0,
            quality: 1.0,
            referential: 1.0,
        }
    }
}

/// Letter grade derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        };
        f.write_str(s)
    }
}

/// Outcome of validating one batch. Immutable once created.
///
/// `accepted_records + rejected_records` always equals the batch size, and
/// `accepted_indices` lists exactly the accepted record positions in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub batch_ref: BatchRef,
    pub layer_scores: LayerScores,
    pub overall_score: f64,
    pub grade: Grade,
    pub errors: Vec<ValidationError>,
    pub accepted_records: usize,
    pub rejected_records: usize,
    pub accepted_indices: Vec<usize>,
}

impl ValidationResult {
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.accepted_records + self.rejected_records
    }

    /// Fraction of the batch that was rejected; 0 for an empty batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_ratio(&self) -> f64 {
        let total = self.total_records();
        if total == 0 {
            0.0
        } else {
            self.rejected_records as f64 / total as f64
        }
    }

    /// Reject-severity findings attached to individual records.
    pub fn record_rejections(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == IssueSeverity::Reject && e.record_ref.is_some())
    }
}

/// A rejected record kept for operator inspection (dead-letter row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub entity: EntityName,
    pub record_json: String,
    pub rule_name: String,
    pub message: String,
    pub rejected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(accepted: usize, rejected: usize) -> ValidationResult {
        ValidationResult {
            batch_ref: BatchRef {
                entity: EntityName::new("orders"),
                sequence_no: 1,
            },
            layer_scores: LayerScores::default(),
            overall_score: 1.0,
            grade: Grade::A,
            errors: vec![],
            accepted_records: accepted,
            rejected_records: rejected,
            accepted_indices: (0..accepted).collect(),
        }
    }

    #[test]
    fn rejection_ratio_of_empty_batch_is_zero() {
        assert!(result(0, 0).rejection_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn rejection_ratio_counts_rejected_share() {
        let r = result(90, 10);
        assert_eq!(r.total_records(), 100);
        assert!((r.rejection_ratio() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn grades_order_best_first() {
        assert!(Grade::A < Grade::F);
        assert_eq!(Grade::C.to_string(), "C");
    }

    #[test]
    fn record_rejections_skip_batch_level_and_warnings() {
        let mut r = result(1, 1);
        r.errors = vec![
            ValidationError::record(0, Some("qty"), "range", "too small", IssueSeverity::Reject),
            ValidationError::record(1, None, "regex", "odd", IssueSeverity::Warn),
            ValidationError::batch("null_rate", "too many nulls", IssueSeverity::Reject),
        ];
        assert_eq!(r.record_rejections().count(), 1);
    }
}
