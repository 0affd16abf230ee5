//! Batch-level statistics: completeness and duplicate keys.

use std::collections::{BTreeSet, HashSet};

use wmsync_types::record::Record;

use super::key_text;
use super::score::rate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct QualityStats {
    /// Non-null cells over expected cells.
    pub completeness: f64,
    /// Records repeating an earlier key over records carrying a key.
    pub duplicate_rate: f64,
}

impl QualityStats {
    pub(crate) fn null_rate(&self) -> f64 {
        1.0 - self.completeness
    }

    pub(crate) fn uniqueness(&self) -> f64 {
        1.0 - self.duplicate_rate
    }
}

/// Measure `records`. Expected cells are the `declared` fields, or the
/// union of keys seen when no schema is declared.
pub(crate) fn measure<'a>(
    records: &[&'a Record],
    declared: Option<Vec<&'a str>>,
    primary_key: &str,
) -> QualityStats {
    let fields: Vec<&str> = declared.unwrap_or_else(|| {
        records
            .iter()
            .copied()
            .flat_map(|r| r.keys().map(String::as_str))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    });

    let expected = fields.len() * records.len();
    let present = records
        .iter()
        .map(|r| {
            fields
                .iter()
                .filter(|f| r.get(**f).is_some_and(|v| !v.is_null()))
                .count()
        })
        .sum();

    let mut seen = HashSet::new();
    let mut keyed = 0usize;
    let mut duplicates = 0usize;
    for record in records {
        if let Some(key) = record.get(primary_key).and_then(key_text) {
            keyed += 1;
            if !seen.insert(key) {
                duplicates += 1;
            }
        }
    }

    QualityStats {
        completeness: rate(present, expected),
        duplicate_rate: if keyed == 0 {
            0.0
        } else {
            1.0 - rate(keyed - duplicates, keyed)
        },
    }
}
