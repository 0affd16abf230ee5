//! Sync modes and the line-oriented extractor protocol.
//!
//! The external extractor writes one JSON message per line: schema
//! declarations, one message per extracted record, and periodic state
//! checkpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::state::{CursorValue, EntityName};

/// How a run reads the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Reconciliation sweep over the whole dataset, descending on a stable key.
    Full,
    /// Change capture since the last bookmark, on a modification timestamp.
    Incremental,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown sync mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode '{0}', expected 'full' or 'incremental'")]
pub struct UnknownSyncMode(pub String);

impl std::str::FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(UnknownSyncMode(other.to_string())),
        }
    }
}

/// One message emitted by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineMessage {
    Schema {
        stream: EntityName,
        schema: serde_json::Value,
        #[serde(default)]
        key_properties: Vec<String>,
    },
    Record {
        stream: EntityName,
        record: Record,
    },
    State {
        value: StatePayload,
    },
}

/// Body of a `STATE` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(default)]
    pub bookmarks: BTreeMap<EntityName, StateBookmark>,
}

/// Per-entity position carried by a `STATE` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBookmark {
    pub replication_key_value: CursorValue,
}

/// Error decoding one protocol line.
#[derive(Debug, thiserror::Error)]
#[error("malformed extractor message: {0}")]
pub struct MessageDecodeError(#[from] serde_json::Error);

impl PipelineMessage {
    /// Decode a single line. Returns `Ok(None)` for blank lines.
    ///
    /// # Errors
    ///
    /// Returns [`MessageDecodeError`] when the line is not a known message.
    pub fn decode_line(line: &str) -> Result<Option<Self>, MessageDecodeError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(trimmed)?))
    }

    /// Encode as a single protocol line (without trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if the record payload cannot be serialized.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
