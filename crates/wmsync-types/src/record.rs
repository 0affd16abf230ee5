//! Records and batches flowing through one validate/commit cycle.

use serde::{Deserialize, Serialize};

use crate::state::{CursorValue, EntityName};

/// A single extracted record: a JSON object keyed by field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A bounded group of records for one entity.
///
/// Owned by the orchestrator for the duration of one validate/commit cycle
/// and never persisted as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub entity: EntityName,
    /// Position of this batch in the entity's stream, starting at 1.
    pub sequence_no: u64,
    pub records: Vec<Record>,
    /// Source position reached once this batch is committed.
    pub source_checkpoint: Option<CursorValue>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Short human-readable reference used in logs and validation results.
    #[must_use]
    pub fn reference(&self) -> BatchRef {
        BatchRef {
            entity: self.entity.clone(),
            sequence_no: self.sequence_no,
        }
    }
}

/// Identifies a batch without holding its records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRef {
    pub entity: EntityName,
    pub sequence_no: u64,
}

impl std::fmt::Display for BatchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity, self.sequence_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_reference_display() {
        let batch = Batch {
            entity: EntityName::new("orders"),
            sequence_no: 3,
            records: vec![Record::new()],
            source_checkpoint: None,
        };
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.reference().to_string(), "orders#3");
    }
}
