//! Typed sync configuration.
//!
//! Every section except `target` and `pipeline` is optional and falls back to
//! the documented defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wmsync_types::alert::Severity;
use wmsync_types::state::EntityName;
use wmsync_types::validation::IssueSeverity;
use wmsync_types::wire::SyncMode;

/// Root configuration handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub modes: ModesConfig,
    /// Upper bound on concurrently validating/committing batches.
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,
    pub target: TargetConfig,
    pub pipeline: PipelineCommandConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub state: StateConfig,
}

fn default_parallel_threads() -> usize {
    4
}

impl SyncConfig {
    /// Policy for `mode`.
    #[must_use]
    pub fn mode(&self, mode: SyncMode) -> &ModeConfig {
        match mode {
            SyncMode::Full => &self.modes.full,
            SyncMode::Incremental => &self.modes.incremental,
        }
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesConfig {
    #[serde(default = "ModeConfig::full_defaults")]
    pub full: ModeConfig,
    #[serde(default = "ModeConfig::incremental_defaults")]
    pub incremental: ModeConfig,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            full: ModeConfig::full_defaults(),
            incremental: ModeConfig::incremental_defaults(),
        }
    }
}

/// Per-mode ordering, paging, timeout and tolerance policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Replication key: a stable id for full sync, a modification
    /// timestamp for incremental sync.
    pub ordering_key: String,
    pub page_size: u32,
    pub batch_size: usize,
    /// Longest wait for the next extractor message.
    pub request_timeout_ms: u64,
    /// Wall-clock budget for the whole run.
    pub total_timeout_secs: u64,
    /// Highest tolerated `rejected / total` per batch.
    pub error_tolerance_ratio: f64,
    /// Incremental only: how far before the bookmark to restart reading.
    #[serde(default)]
    pub overlap_window_secs: u64,
}

impl ModeConfig {
    #[must_use]
    pub fn full_defaults() -> Self {
        Self {
            ordering_key: "id".into(),
            page_size: 1000,
            batch_size: 500,
            request_timeout_ms: 60_000,
            total_timeout_secs: 3600,
            error_tolerance_ratio: 0.05,
            overlap_window_secs: 0,
        }
    }

    #[must_use]
    pub fn incremental_defaults() -> Self {
        Self {
            ordering_key: "updated_at".into(),
            page_size: 200,
            batch_size: 100,
            request_timeout_ms: 30_000,
            total_timeout_secs: 900,
            error_tolerance_ratio: 0.05,
            overlap_window_secs: 300,
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    #[must_use]
    pub fn overlap_window(&self) -> Duration {
        Duration::from_secs(self.overlap_window_secs)
    }
}

// ---------------------------------------------------------------------------
// Target database and pool
// ---------------------------------------------------------------------------

/// Relational target receiving committed batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// libpq-style connection string or `postgresql://` URI.
    pub connection: String,
    #[serde(default = "default_target_schema")]
    pub schema: String,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

fn default_target_schema() -> String {
    "public".into()
}

fn default_commit_timeout_ms() -> u64 {
    30_000
}

impl TargetConfig {
    #[must_use]
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub max_overflow: usize,
    pub lease_timeout_ms: u64,
    /// Health-check retries for a degraded connection before it is declared dead.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub max_wait_ms: u64,
    /// Two failovers closer than this (with no healthy lease between) escalate.
    pub escalation_window_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 2,
            lease_timeout_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            max_wait_ms: 5_000,
            escalation_window_secs: 300,
        }
    }
}

impl PoolConfig {
    /// Freshly opened connections one lease may discard as dead before
    /// the pool is declared unavailable.
    #[must_use]
    pub fn max_replacements(&self) -> usize {
        self.max_retries as usize + 1
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    #[must_use]
    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs)
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Extra channels besides the built-in `log` channel.
    pub channels: Vec<ChannelConfig>,
    /// Severity to channel names. Severities left out use the default route.
    pub routing: BTreeMap<Severity, Vec<String>>,
    pub rate_limit: RateLimitConfig,
    pub retry: AlertRetryConfig,
    pub http_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            routing: BTreeMap::new(),
            rate_limit: RateLimitConfig::default(),
            retry: AlertRetryConfig::default(),
            http_timeout_ms: 5_000,
        }
    }
}

impl AlertConfig {
    /// Names of every channel the dispatcher will register.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        std::iter::once(crate::alert::LOG_CHANNEL)
            .chain(self.channels.iter().map(ChannelConfig::name))
            .collect()
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// A pluggable alert channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Generic HTTP POST of the alert JSON.
    Webhook { name: String, url: String },
    /// Chat-style incoming webhook (`{"text": ...}`).
    Chat { name: String, url: String },
}

impl ChannelConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Webhook { name, .. } | Self::Chat { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_per_window: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_per_window: 5,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRetryConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for AlertRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub entities: BTreeMap<EntityName, EntityRules>,
    pub max_errors_per_batch: usize,
    pub max_null_rate: Option<f64>,
    pub max_duplicate_rate: Option<f64>,
    /// Reject the whole batch (instead of warning) when a quality threshold is breached.
    pub strict_quality_mode: bool,
    pub grade_thresholds: GradeThresholds,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            max_errors_per_batch: 1000,
            max_null_rate: None,
            max_duplicate_rate: None,
            strict_quality_mode: false,
            grade_thresholds: GradeThresholds::default(),
        }
    }
}

/// Rules for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRules {
    #[serde(default)]
    pub schema: Option<EntitySchema>,
    #[serde(default)]
    pub rules: Vec<BusinessRule>,
    #[serde(default)]
    pub references: Vec<ReferenceRule>,
}

/// Declared structure of an entity's records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub primary_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    /// RFC 3339 string.
    Timestamp,
    Object,
    Array,
    Any,
}

impl FieldType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// A named domain predicate on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub name: String,
    pub field: String,
    #[serde(default = "default_rule_severity")]
    pub severity: IssueSeverity,
    #[serde(flatten)]
    pub check: RuleCheck,
}

fn default_rule_severity() -> IssueSeverity {
    IssueSeverity::Reject
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleCheck {
    NotNull,
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        /// Exclude the bounds themselves.
        #[serde(default)]
        exclusive: bool,
    },
    AllowedValues {
        values: Vec<serde_json::Value>,
    },
    Regex {
        pattern: String,
    },
}

/// Cross-entity key existence requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub field: String,
    pub references: EntityName,
    #[serde(default = "default_rule_severity")]
    pub severity: IssueSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeThresholds {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            a: 0.95,
            b: 0.90,
            c: 0.80,
            d: 0.70,
        }
    }
}

// ---------------------------------------------------------------------------
// Extractor command and state storage
// ---------------------------------------------------------------------------

/// How to start the external extract/load pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// Atomic JSON bookmark file (no run ledger).
    File,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_backend")]
    pub backend: StateBackendKind,
    /// File or database path for `file` and `sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Connection string for `postgres`.
    #[serde(default)]
    pub connection: Option<String>,
}

fn default_state_backend() -> StateBackendKind {
    StateBackendKind::File
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            path: None,
            connection: None,
        }
    }
}

impl StateConfig {
    /// Effective path for file-based backends.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| match self.backend {
            StateBackendKind::Sqlite => PathBuf::from("state/wmsync.db"),
            StateBackendKind::File | StateBackendKind::Postgres => {
                PathBuf::from("state/bookmarks.json")
            }
        })
    }
}
