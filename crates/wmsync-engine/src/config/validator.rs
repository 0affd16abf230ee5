//! Semantic validation for parsed sync configuration values.

use std::collections::BTreeSet;

use wmsync_types::wire::SyncMode;

use crate::config::types::{
    AlertConfig, ModeConfig, PoolConfig, RuleCheck, SyncConfig, ValidationConfig,
};
use crate::error::ConfigurationError;

fn validate_mode(mode: SyncMode, cfg: &ModeConfig, errors: &mut Vec<String>) {
    let ctx = format!("modes.{mode}");
    if cfg.ordering_key.trim().is_empty() {
        errors.push(format!("{ctx}: ordering_key must not be empty"));
    }
    if cfg.page_size == 0 {
        errors.push(format!("{ctx}: page_size must be at least 1"));
    }
    if cfg.batch_size == 0 {
        errors.push(format!("{ctx}: batch_size must be at least 1"));
    }
    if !(0.0..=1.0).contains(&cfg.error_tolerance_ratio) {
        errors.push(format!(
            "{ctx}: error_tolerance_ratio {} is outside [0, 1]",
            cfg.error_tolerance_ratio
        ));
    }
    if cfg.request_timeout_ms == 0 {
        errors.push(format!("{ctx}: request_timeout_ms must be > 0"));
    }
    if cfg.total_timeout_secs == 0 {
        errors.push(format!("{ctx}: total_timeout_secs must be > 0"));
    }
    if cfg.request_timeout() > cfg.total_timeout() {
        errors.push(format!(
            "{ctx}: request_timeout_ms ({}) exceeds total_timeout_secs ({})",
            cfg.request_timeout_ms, cfg.total_timeout_secs
        ));
    }
}

fn validate_pool(cfg: &PoolConfig, errors: &mut Vec<String>) {
    if cfg.pool_size == 0 {
        errors.push("pool.pool_size must be at least 1".to_string());
    }
    if cfg.lease_timeout_ms == 0 {
        errors.push("pool.lease_timeout_ms must be > 0".to_string());
    }
    if !cfg.backoff_multiplier.is_finite() || cfg.backoff_multiplier < 1.0 {
        errors.push(format!(
            "pool.backoff_multiplier {} must be >= 1",
            cfg.backoff_multiplier
        ));
    }
    if cfg.max_wait_ms < cfg.backoff_base_ms {
        errors.push(format!(
            "pool.max_wait_ms ({}) is below backoff_base_ms ({})",
            cfg.max_wait_ms, cfg.backoff_base_ms
        ));
    }
}

fn validate_alerts(cfg: &AlertConfig, errors: &mut Vec<String>) {
    let mut names = BTreeSet::new();
    for name in cfg.channel_names() {
        if name.trim().is_empty() {
            errors.push("alerts.channels: channel name must not be empty".to_string());
        } else if !names.insert(name) {
            errors.push(format!("alerts.channels: duplicate channel name '{name}'"));
        }
    }

    for (severity, route) in &cfg.routing {
        for name in route {
            if !names.contains(name.as_str()) {
                errors.push(format!(
                    "alerts.routing.{severity}: unknown channel '{name}'"
                ));
            }
        }
    }

    if cfg.rate_limit.window_secs == 0 {
        errors.push("alerts.rate_limit.window_secs must be > 0".to_string());
    }
    if cfg.rate_limit.max_per_window == 0 {
        errors.push("alerts.rate_limit.max_per_window must be at least 1".to_string());
    }
    if cfg.retry.max_attempts == 0 {
        errors.push("alerts.retry.max_attempts must be at least 1".to_string());
    }
}

fn validate_validation(cfg: &ValidationConfig, errors: &mut Vec<String>) {
    if cfg.max_errors_per_batch == 0 {
        errors.push("validation.max_errors_per_batch must be at least 1".to_string());
    }
    for (label, rate) in [
        ("max_null_rate", cfg.max_null_rate),
        ("max_duplicate_rate", cfg.max_duplicate_rate),
    ] {
        if let Some(rate) = rate {
            if !(0.0..=1.0).contains(&rate) {
                errors.push(format!("validation.{label} {rate} is outside [0, 1]"));
            }
        }
    }

    let g = &cfg.grade_thresholds;
    if !(g.a <= 1.0 && g.a > g.b && g.b > g.c && g.c > g.d && g.d >= 0.0) {
        errors.push(format!(
            "validation.grade_thresholds must be strictly descending within [0, 1] (a={}, b={}, c={}, d={})",
            g.a, g.b, g.c, g.d
        ));
    }

    for (entity, rules) in &cfg.entities {
        let ctx = format!("validation.entities.{entity}");
        let has_schema = rules.schema.is_some();

        if let Some(schema) = &rules.schema {
            if let Some(pk) = &schema.primary_key {
                if !schema.fields.is_empty() && !schema.fields.contains_key(pk) {
                    errors.push(format!("{ctx}: primary_key '{pk}' is not a declared field"));
                }
            }
        }

        if !has_schema && (!rules.rules.is_empty() || !rules.references.is_empty()) {
            errors.push(format!(
                "{ctx}: business or reference rules require a declared schema"
            ));
        }

        let mut rule_names = BTreeSet::new();
        for rule in &rules.rules {
            if rule.name.trim().is_empty() {
                errors.push(format!("{ctx}: rule on field '{}' has an empty name", rule.field));
            } else if !rule_names.insert(rule.name.as_str()) {
                errors.push(format!("{ctx}: duplicate rule name '{}'", rule.name));
            }
            match &rule.check {
                RuleCheck::Range { min, max, .. } => {
                    if min.is_none() && max.is_none() {
                        errors.push(format!("{ctx}: range rule '{}' needs min or max", rule.name));
                    }
                    if let (Some(lo), Some(hi)) = (min, max) {
                        if lo > hi {
                            errors.push(format!(
                                "{ctx}: range rule '{}' has min {lo} > max {hi}",
                                rule.name
                            ));
                        }
                    }
                }
                RuleCheck::AllowedValues { values } if values.is_empty() => {
                    errors.push(format!(
                        "{ctx}: allowed_values rule '{}' lists no values",
                        rule.name
                    ));
                }
                RuleCheck::Regex { pattern } => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        errors.push(format!("{ctx}: regex rule '{}' is invalid: {e}", rule.name));
                    }
                }
                RuleCheck::NotNull | RuleCheck::AllowedValues { .. } => {}
            }
        }

        for reference in &rules.references {
            if reference.field.trim().is_empty() {
                errors.push(format!("{ctx}: reference rule has an empty field"));
            }
            let target_declared = cfg
                .entities
                .get(&reference.references)
                .is_some_and(|r| r.schema.is_some());
            if !target_declared {
                errors.push(format!(
                    "{ctx}: reference to '{}' which has no declared schema",
                    reference.references
                ));
            }
        }
    }
}

/// Validate a parsed sync configuration.
/// Returns `Ok(())` if valid, Err with all validation problems if not.
///
/// # Errors
///
/// Returns [`ConfigurationError::Invalid`] listing every problem found.
pub fn validate_config(config: &SyncConfig) -> Result<(), ConfigurationError> {
    let mut errors = Vec::new();

    validate_mode(SyncMode::Full, &config.modes.full, &mut errors);
    validate_mode(SyncMode::Incremental, &config.modes.incremental, &mut errors);

    if config.parallel_threads == 0 {
        errors.push("parallel_threads must be at least 1".to_string());
    }
    if config.target.connection.trim().is_empty() {
        errors.push("target.connection must not be empty".to_string());
    }
    if config.target.commit_timeout_ms == 0 {
        errors.push("target.commit_timeout_ms must be > 0".to_string());
    }
    if config.pipeline.command.trim().is_empty() {
        errors.push("pipeline.command must not be empty".to_string());
    }
    if config.pipeline.channel_capacity == 0 {
        errors.push("pipeline.channel_capacity must be at least 1".to_string());
    }

    validate_pool(&config.pool, &mut errors);
    validate_alerts(&config.alerts, &mut errors);
    validate_validation(&config.validation, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::Invalid(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_config_str;
    use crate::config::types::{BusinessRule, EntityRules, EntitySchema, ReferenceRule};
    use wmsync_types::alert::Severity;
    use wmsync_types::state::EntityName;
    use wmsync_types::validation::IssueSeverity;

    fn base_config() -> SyncConfig {
        parse_config_str(
            "target:\n  connection: host=localhost\npipeline:\n  command: tap-wms\n",
        )
        .unwrap()
    }

    fn problems(config: &SyncConfig) -> Vec<String> {
        validate_config(config)
            .err()
            .map(|e| e.problems().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_collects_all_mode_problems() {
        let mut config = base_config();
        config.modes.full.ordering_key = "  ".into();
        config.modes.full.batch_size = 0;
        config.modes.incremental.error_tolerance_ratio = 1.5;
        let found = problems(&config);
        assert_eq!(found.len(), 3, "{found:?}");
        assert!(found.iter().any(|p| p.contains("modes.full: ordering_key")));
        assert!(found.iter().any(|p| p.contains("modes.full: batch_size")));
        assert!(found.iter().any(|p| p.contains("modes.incremental: error_tolerance_ratio")));
    }

    #[test]
    fn test_request_timeout_above_total_timeout_rejected() {
        let mut config = base_config();
        config.modes.incremental.request_timeout_ms = 10_000;
        config.modes.incremental.total_timeout_secs = 5;
        let found = problems(&config);
        assert!(found.iter().any(|p| p.contains("exceeds total_timeout_secs")));
    }

    #[test]
    fn test_unknown_routing_channel_rejected() {
        let mut config = base_config();
        config
            .alerts
            .routing
            .insert(Severity::Critical, vec!["log".into(), "pager".into()]);
        let found = problems(&config);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("unknown channel 'pager'"));
    }

    #[test]
    fn test_grade_thresholds_must_descend() {
        let mut config = base_config();
        config.validation.grade_thresholds.c = 0.95;
        assert!(problems(&config)
            .iter()
            .any(|p| p.contains("grade_thresholds")));
    }

    #[test]
    fn test_rules_without_schema_rejected() {
        let mut config = base_config();
        config.validation.entities.insert(
            EntityName::new("orders"),
            EntityRules {
                schema: None,
                rules: vec![BusinessRule {
                    name: "qty_positive".into(),
                    field: "qty".into(),
                    severity: IssueSeverity::Reject,
                    check: RuleCheck::Range {
                        min: Some(0.0),
                        max: None,
                        exclusive: true,
                    },
                }],
                references: vec![],
            },
        );
        assert!(problems(&config)
            .iter()
            .any(|p| p.contains("require a declared schema")));
    }

    #[test]
    fn test_reference_to_undeclared_entity_and_bad_regex() {
        let mut config = base_config();
        config.validation.entities.insert(
            EntityName::new("order_details"),
            EntityRules {
                schema: Some(EntitySchema::default()),
                rules: vec![BusinessRule {
                    name: "sku_format".into(),
                    field: "sku".into(),
                    severity: IssueSeverity::Warn,
                    check: RuleCheck::Regex {
                        pattern: "([a-z".into(),
                    },
                }],
                references: vec![ReferenceRule {
                    field: "order_id".into(),
                    references: EntityName::new("orders"),
                    severity: IssueSeverity::Reject,
                }],
            },
        );
        let found = problems(&config);
        assert_eq!(found.len(), 2, "{found:?}");
        assert!(found.iter().any(|p| p.contains("regex rule 'sku_format'")));
        assert!(found.iter().any(|p| p.contains("reference to 'orders'")));
    }

    #[test]
    fn test_zero_parallelism_and_empty_command_rejected() {
        let mut config = base_config();
        config.parallel_threads = 0;
        config.pipeline.command = String::new();
        let found = problems(&config);
        assert_eq!(found.len(), 2);
    }
}
