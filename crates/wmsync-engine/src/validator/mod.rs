//! Four-layer batch validation with quality scoring.
//!
//! Layers run in order: schema, business rules, quality, referential
//! integrity. A record failing schema is rejected and skipped by the later
//! layers. Validation never fails as a call; every finding is folded into
//! the returned [`ValidationResult`].

mod quality;
mod referential;
mod rules;
mod schema;
mod score;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use wmsync_types::record::{Batch, Record};
use wmsync_types::state::EntityName;
use wmsync_types::validation::{
    IssueSeverity, LayerScores, ValidationError, ValidationResult,
};

use crate::config::{EntitySchema, ReferenceRule, ValidationConfig};
use crate::error::ConfigurationError;

pub use referential::{ChainedLookup, CommittedKeyIndex, ReferenceLookup};

use rules::CompiledRule;
use score::{rate, Metrics};

/// Key column assumed when no schema names one.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Key text used for duplicate and reference checks; `None` for null.
#[must_use]
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RecordOutcome {
    schema_failed: bool,
    business_rejected: bool,
    business_warned: bool,
    referential_rejected: bool,
    referential_warned: bool,
}

impl RecordOutcome {
    fn rejected(self) -> bool {
        self.schema_failed || self.business_rejected || self.referential_rejected
    }

    fn business_failed(self) -> bool {
        self.business_rejected || self.business_warned
    }

    fn referential_failed(self) -> bool {
        self.referential_rejected || self.referential_warned
    }
}

/// Collects errors up to a cap and remembers whether it overflowed.
struct ErrorSink {
    errors: Vec<ValidationError>,
    cap: usize,
    overflowed: bool,
}

impl ErrorSink {
    fn new(cap: usize) -> Self {
        Self {
            errors: Vec::new(),
            cap: cap.max(1),
            overflowed: false,
        }
    }

    fn push(&mut self, error: ValidationError) {
        if self.errors.len() >= self.cap {
            self.overflowed = true;
        } else {
            self.errors.push(error);
        }
    }

    fn extend(&mut self, errors: impl IntoIterator<Item = ValidationError>) {
        for error in errors {
            self.push(error);
        }
    }
}

/// Validates batches against the configured rule set.
#[derive(Debug)]
pub struct DataValidator {
    config: ValidationConfig,
    rules: BTreeMap<EntityName, Vec<CompiledRule>>,
    derived: RwLock<BTreeMap<EntityName, EntitySchema>>,
}

impl DataValidator {
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if a rule cannot be compiled.
    pub fn new(config: ValidationConfig) -> Result<Self, ConfigurationError> {
        let mut problems = Vec::new();
        let mut rules = BTreeMap::new();
        for (entity, entity_rules) in &config.entities {
            let mut compiled = Vec::with_capacity(entity_rules.rules.len());
            for rule in &entity_rules.rules {
                match CompiledRule::compile(rule) {
                    Ok(rule) => compiled.push(rule),
                    Err(e) => problems.push(format!("validation.entities.{entity}: {e}")),
                }
            }
            rules.insert(entity.clone(), compiled);
        }
        if !problems.is_empty() {
            return Err(ConfigurationError::Invalid(problems));
        }
        Ok(Self {
            config,
            rules,
            derived: RwLock::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Adopt a schema announced by the pipeline, unless one is configured.
    /// Returns whether the schema was registered.
    pub fn register_derived_schema(
        &self,
        entity: &EntityName,
        json_schema: &Value,
        key_properties: &[String],
    ) -> bool {
        if self.configured_schema(entity).is_some() {
            return false;
        }
        let schema = schema::derive_schema(json_schema, key_properties);
        if schema.fields.is_empty() && schema.primary_key.is_none() {
            return false;
        }
        tracing::debug!(
            entity = %entity,
            fields = schema.fields.len(),
            primary_key = ?schema.primary_key,
            "Registered schema announced by pipeline"
        );
        self.derived
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.clone(), schema);
        true
    }

    fn configured_schema(&self, entity: &EntityName) -> Option<&EntitySchema> {
        self.config
            .entities
            .get(entity)
            .and_then(|rules| rules.schema.as_ref())
    }

    /// Configured schema, else the one derived from the pipeline.
    #[must_use]
    pub fn schema_for(&self, entity: &EntityName) -> Option<EntitySchema> {
        self.configured_schema(entity).cloned().or_else(|| {
            self.derived
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(entity)
                .cloned()
        })
    }

    #[must_use]
    pub fn primary_key_for(&self, entity: &EntityName) -> String {
        self.schema_for(entity)
            .and_then(|s| s.primary_key)
            .unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string())
    }

    /// Every entity some reference rule points at.
    #[must_use]
    pub fn referenced_entities(&self) -> BTreeSet<EntityName> {
        self.config
            .entities
            .values()
            .flat_map(|rules| rules.references.iter().map(|r| r.references.clone()))
            .collect()
    }

    fn references_of(&self, entity: &EntityName) -> &[ReferenceRule] {
        self.config
            .entities
            .get(entity)
            .map(|rules| rules.references.as_slice())
            .unwrap_or_default()
    }

    /// Validate one batch. `lookup` answers referential checks.
    #[allow(clippy::too_many_lines)]
    pub fn validate(&self, batch: &Batch, lookup: &dyn ReferenceLookup) -> ValidationResult {
        let total = batch.len();
        let batch_ref = batch.reference();
        if total == 0 {
            return ValidationResult {
                batch_ref,
                layer_scores: LayerScores::default(),
                overall_score: 1.0,
                grade: score::grade(1.0, &self.config.grade_thresholds),
                errors: Vec::new(),
                accepted_records: 0,
                rejected_records: 0,
                accepted_indices: Vec::new(),
            };
        }

        let schema = self.schema_for(&batch.entity);
        let primary_key = schema
            .as_ref()
            .and_then(|s| s.primary_key.clone())
            .unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string());
        let mut sink = ErrorSink::new(self.config.max_errors_per_batch);
        let mut outcomes = vec![RecordOutcome::default(); total];

        // Schema
        if let Some(schema) = &schema {
            for (idx, record) in batch.records.iter().enumerate() {
                let issues = schema::check_record(idx, record, schema);
                if !issues.is_empty() {
                    outcomes[idx].schema_failed = true;
                    sink.extend(issues);
                }
            }
        }
        for (idx, record) in batch.records.iter().enumerate() {
            if outcomes[idx].schema_failed {
                continue;
            }
            if let Some(issue) = schema::check_primary_key(idx, record, &primary_key) {
                outcomes[idx].schema_failed = true;
                sink.push(issue);
            }
        }
        let schema_valid: Vec<usize> = (0..total).filter(|&i| !outcomes[i].schema_failed).collect();

        // Business rules
        if let Some(rules) = self.rules.get(&batch.entity) {
            for &idx in &schema_valid {
                for rule in rules {
                    let Some(message) = rule.evaluate(&batch.records[idx]) else {
                        continue;
                    };
                    match rule.severity {
                        IssueSeverity::Reject => outcomes[idx].business_rejected = true,
                        IssueSeverity::Warn => outcomes[idx].business_warned = true,
                    }
                    sink.push(ValidationError::record(
                        idx,
                        Some(rule.field.as_str()),
                        rule.name.clone(),
                        message,
                        rule.severity,
                    ));
                }
            }
        }

        // Quality
        let valid_records: Vec<&Record> = schema_valid.iter().map(|&i| &batch.records[i]).collect();
        let declared = schema
            .as_ref()
            .filter(|s| !s.fields.is_empty())
            .map(|s| s.fields.keys().map(String::as_str).collect());
        let stats = quality::measure(&valid_records, declared, &primary_key);
        let quality_severity = if self.config.strict_quality_mode {
            IssueSeverity::Reject
        } else {
            IssueSeverity::Warn
        };
        let mut quality_breached = false;
        if let Some(max) = self.config.max_null_rate {
            if stats.null_rate() > max {
                quality_breached = true;
                sink.push(ValidationError::batch(
                    "quality.null_rate",
                    format!("null rate {:.3} exceeds {max}", stats.null_rate()),
                    quality_severity,
                ));
            }
        }
        if let Some(max) = self.config.max_duplicate_rate {
            if stats.duplicate_rate > max {
                quality_breached = true;
                sink.push(ValidationError::batch(
                    "quality.duplicate_rate",
                    format!(
                        "duplicate '{primary_key}' rate {:.3} exceeds {max}",
                        stats.duplicate_rate
                    ),
                    quality_severity,
                ));
            }
        }

        // Referential integrity
        let mut unavailable = BTreeSet::new();
        for reference in self.references_of(&batch.entity) {
            let has_values = schema_valid.iter().any(|&idx| {
                batch.records[idx]
                    .get(&reference.field)
                    .is_some_and(|v| !v.is_null())
            });
            if !has_values {
                continue;
            }
            if !lookup.entity_exists(&reference.references) {
                if unavailable.insert(reference.references.clone()) {
                    sink.push(ValidationError::batch(
                        "referential.unavailable",
                        format!(
                            "referenced entity {} is not available; reference checks skipped",
                            reference.references
                        ),
                        IssueSeverity::Warn,
                    ));
                }
                continue;
            }
            for &idx in &schema_valid {
                let Some(key) = batch.records[idx].get(&reference.field).and_then(key_text) else {
                    continue;
                };
                if lookup.key_exists(&reference.references, &key) {
                    continue;
                }
                match reference.severity {
                    IssueSeverity::Reject => outcomes[idx].referential_rejected = true,
                    IssueSeverity::Warn => outcomes[idx].referential_warned = true,
                }
                sink.push(ValidationError::record(
                    idx,
                    Some(reference.field.as_str()),
                    format!("referential.{}", reference.field),
                    format!("{} '{key}' not found in {}", reference.field, reference.references),
                    reference.severity,
                ));
            }
        }

        let valid = schema_valid.len();
        let layer_scores = LayerScores {
            schema: rate(valid, total),
            business: rate(
                schema_valid.iter().filter(|&&i| !outcomes[i].business_failed()).count(),
                valid,
            ),
            quality: (stats.completeness + stats.uniqueness()) / 2.0,
            referential: rate(
                schema_valid.iter().filter(|&&i| !outcomes[i].referential_failed()).count(),
                valid,
            ),
        };
        let metrics = Metrics {
            completeness: stats.completeness,
            accuracy: rate(
                outcomes
                    .iter()
                    .filter(|o| !o.schema_failed && !o.business_rejected)
                    .count(),
                total,
            ),
            consistency: rate(
                schema_valid
                    .iter()
                    .filter(|&&i| !outcomes[i].business_warned && !outcomes[i].referential_warned)
                    .count(),
                valid,
            ),
            uniqueness: stats.uniqueness(),
        };

        let reject_all = sink.overflowed || (quality_breached && self.config.strict_quality_mode);
        let mut errors = sink.errors;
        if sink.overflowed {
            errors.push(ValidationError::batch(
                "max_errors_exceeded",
                format!(
                    "more than {} validation errors; whole batch rejected",
                    self.config.max_errors_per_batch
                ),
                IssueSeverity::Reject,
            ));
        }

        let accepted_indices: Vec<usize> = if reject_all {
            Vec::new()
        } else {
            (0..total).filter(|&i| !outcomes[i].rejected()).collect()
        };
        let accepted_records = accepted_indices.len();
        let overall_score = metrics.overall();
        let grade = score::grade(overall_score, &self.config.grade_thresholds);

        tracing::debug!(
            batch = %batch_ref,
            total,
            accepted = accepted_records,
            errors = errors.len(),
            overall_score,
            %grade,
            "Batch validated"
        );

        ValidationResult {
            batch_ref,
            layer_scores,
            overall_score,
            grade,
            errors,
            accepted_records,
            rejected_records: total - accepted_records,
            accepted_indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusinessRule, EntityRules, FieldSpec, FieldType, RuleCheck};
    use serde_json::json;
    use wmsync_types::validation::Grade;

    fn orders_config() -> ValidationConfig {
        let mut fields = BTreeMap::new();
        fields.insert(
            "id".to_string(),
            FieldSpec {
                field_type: FieldType::Integer,
                required: true,
                nullable: false,
            },
        );
        fields.insert(
            "qty".to_string(),
            FieldSpec {
                field_type: FieldType::Integer,
                required: true,
                nullable: false,
            },
        );
        fields.insert(
            "customer_id".to_string(),
            FieldSpec {
                field_type: FieldType::String,
                required: false,
                nullable: true,
            },
        );
        let mut entities = BTreeMap::new();
        entities.insert(
            EntityName::from("orders"),
            EntityRules {
                schema: Some(EntitySchema {
                    fields,
                    primary_key: Some("id".into()),
                }),
                rules: vec![
                    BusinessRule {
                        name: "qty_positive".into(),
                        field: "qty".into(),
                        severity: IssueSeverity::Reject,
                        check: RuleCheck::Range {
                            min: Some(0.0),
                            max: None,
                            exclusive: true,
                        },
                    },
                    BusinessRule {
                        name: "qty_reasonable".into(),
                        field: "qty".into(),
                        severity: IssueSeverity::Warn,
                        check: RuleCheck::Range {
                            min: None,
                            max: Some(1000.0),
                            exclusive: false,
                        },
                    },
                ],
                references: vec![ReferenceRule {
                    field: "customer_id".into(),
                    references: EntityName::from("customers"),
                    severity: IssueSeverity::Reject,
                }],
            },
        );
        ValidationConfig {
            entities,
            ..ValidationConfig::default()
        }
    }

    fn batch(entity: &str, records: Vec<Value>) -> Batch {
        Batch {
            entity: EntityName::from(entity),
            sequence_no: 1,
            records: records
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap())
                .collect(),
            source_checkpoint: None,
        }
    }

    fn clean(n: i64) -> Vec<Value> {
        (1..=n).map(|i| json!({"id": i, "qty": 5})).collect()
    }

    #[test]
    fn empty_batch_scores_perfect() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let result = validator.validate(&batch("orders", vec![]), &CommittedKeyIndex::default());
        assert_eq!(result.total_records(), 0);
        assert!((result.overall_score - 1.0).abs() < f64::EPSILON);
        assert_eq!(result.grade, Grade::A);
    }

    #[test]
    fn clean_batch_accepts_everything() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let result = validator.validate(&batch("orders", clean(50)), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 50);
        assert_eq!(result.rejected_records, 0);
        assert_eq!(result.grade, Grade::A);
        assert_eq!(result.accepted_indices.len(), 50);
    }

    #[test]
    fn schema_failures_are_rejected_and_skip_business_rules() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let mut records = clean(90);
        for i in 0..10 {
            records.push(json!({"id": 1000 + i, "qty": "many"}));
        }
        let result = validator.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.rejected_records, 10);
        assert_eq!(result.accepted_records, 90);
        assert!((result.rejection_ratio() - 0.10).abs() < 1e-9);
        assert!(result.errors.iter().all(|e| e.rule_name == "schema.type"));
        assert!((result.layer_scores.schema - 0.9).abs() < 1e-9);
    }

    #[test]
    fn warn_rules_keep_records_but_lower_consistency() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let records = vec![json!({"id": 1, "qty": 5}), json!({"id": 2, "qty": 5000})];
        let result = validator.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].severity, IssueSeverity::Warn);
        assert!((result.layer_scores.business - 0.5).abs() < 1e-9);
        assert!(result.overall_score < 1.0);
    }

    #[test]
    fn reject_rule_removes_record() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let records = vec![json!({"id": 1, "qty": 0}), json!({"id": 2, "qty": 3})];
        let result = validator.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_indices, vec![1]);
        assert_eq!(result.record_rejections().count(), 1);
    }

    #[test]
    fn unavailable_reference_is_a_single_batch_warning() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let records = vec![
            json!({"id": 1, "qty": 1, "customer_id": "c-1"}),
            json!({"id": 2, "qty": 1, "customer_id": "c-2"}),
        ];
        let result = validator.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].rule_name, "referential.unavailable");
        assert_eq!(result.errors[0].record_ref, None);
    }

    #[test]
    fn missing_reference_key_rejects() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let customers = EntityName::from("customers");
        let lookup = CommittedKeyIndex::new([customers.clone()]);
        lookup.record_committed(&customers, ["c-1".to_string()]);
        let records = vec![
            json!({"id": 1, "qty": 1, "customer_id": "c-1"}),
            json!({"id": 2, "qty": 1, "customer_id": "c-9"}),
            json!({"id": 3, "qty": 1, "customer_id": null}),
        ];
        let result = validator.validate(&batch("orders", records), &lookup);
        assert_eq!(result.accepted_indices, vec![0, 2]);
        assert_eq!(result.errors[0].rule_name, "referential.customer_id");
        assert!((result.layer_scores.referential - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn error_cap_rejects_whole_batch() {
        let config = ValidationConfig {
            max_errors_per_batch: 3,
            ..orders_config()
        };
        let validator = DataValidator::new(config).unwrap();
        let mut records = clean(10);
        for i in 0..5 {
            records.push(json!({"id": 100 + i, "qty": "x"}));
        }
        let result = validator.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 0);
        assert_eq!(result.rejected_records, 15);
        assert_eq!(result.errors.len(), 4);
        assert_eq!(result.errors[3].rule_name, "max_errors_exceeded");
    }

    #[test]
    fn duplicate_threshold_warns_unless_strict() {
        let records = vec![
            json!({"id": 1, "qty": 1}),
            json!({"id": 1, "qty": 1}),
            json!({"id": 2, "qty": 1}),
        ];
        let lenient = DataValidator::new(ValidationConfig {
            max_duplicate_rate: Some(0.1),
            ..orders_config()
        })
        .unwrap();
        let result = lenient.validate(&batch("orders", records.clone()), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 3);
        assert_eq!(result.errors[0].rule_name, "quality.duplicate_rate");
        assert_eq!(result.errors[0].severity, IssueSeverity::Warn);

        let strict = DataValidator::new(ValidationConfig {
            max_duplicate_rate: Some(0.1),
            strict_quality_mode: true,
            ..orders_config()
        })
        .unwrap();
        let result = strict.validate(&batch("orders", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 0);
        assert_eq!(result.rejected_records, 3);
    }

    #[test]
    fn derived_schema_applies_only_without_configured_one() {
        let validator = DataValidator::new(orders_config()).unwrap();
        let json_schema = json!({
            "properties": {"sku": {"type": "string"}},
            "required": ["sku"]
        });
        assert!(!validator.register_derived_schema(&EntityName::from("orders"), &json_schema, &[]));

        let products = EntityName::from("products");
        assert!(validator.register_derived_schema(&products, &json_schema, &["sku".to_string()]));
        assert_eq!(validator.primary_key_for(&products), "sku");

        let result = validator.validate(
            &batch("products", vec![json!({"sku": "a"}), json!({"name": "no sku"})]),
            &CommittedKeyIndex::default(),
        );
        assert_eq!(result.accepted_indices, vec![0]);
    }

    #[test]
    fn unconfigured_entity_defaults_to_id_key() {
        let validator = DataValidator::new(ValidationConfig::default()).unwrap();
        assert_eq!(validator.primary_key_for(&EntityName::from("bins")), "id");
        let result = validator.validate(&batch("bins", clean(3)), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_records, 3);
    }

    #[test]
    fn keyless_records_are_rejected_without_a_schema() {
        let validator = DataValidator::new(ValidationConfig::default()).unwrap();
        let records = vec![
            json!({"id": 1, "qty": 5}),
            json!({"qty": 5}),
            json!({"id": null, "qty": 5}),
        ];
        let result = validator.validate(&batch("bins", records), &CommittedKeyIndex::default());
        assert_eq!(result.accepted_indices, vec![0]);
        assert_eq!(result.rejected_records, 2);
        assert!(result.errors.iter().all(|e| e.rule_name == "schema.primary_key"));
        assert_eq!(result.errors[0].record_ref, Some(1));
    }

    #[test]
    fn invalid_regex_is_configuration_error() {
        let mut config = orders_config();
        if let Some(rules) = config.entities.get_mut(&EntityName::from("orders")) {
            rules.rules.push(BusinessRule {
                name: "bad".into(),
                field: "id".into(),
                severity: IssueSeverity::Warn,
                check: RuleCheck::Regex {
                    pattern: "[".into(),
                },
            });
        }
        let err = DataValidator::new(config).unwrap_err();
        assert_eq!(err.problems().len(), 1);
    }
}
