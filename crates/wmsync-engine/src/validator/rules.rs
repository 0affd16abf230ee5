//! Configured business rules, with regexes compiled once.

use regex::Regex;
use serde_json::Value;
use wmsync_types::record::Record;
use wmsync_types::validation::IssueSeverity;

use crate::config::{BusinessRule, RuleCheck};

#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub name: String,
    pub field: String,
    pub severity: IssueSeverity,
    check: Check,
}

#[derive(Debug, Clone)]
enum Check {
    NotNull,
    Range {
        min: Option<f64>,
        max: Option<f64>,
        exclusive: bool,
    },
    AllowedValues(Vec<Value>),
    Regex(Regex),
}

impl CompiledRule {
    pub(crate) fn compile(rule: &BusinessRule) -> Result<Self, String> {
        let check = match &rule.check {
            RuleCheck::NotNull => Check::NotNull,
            RuleCheck::Range {
                min,
                max,
                exclusive,
            } => Check::Range {
                min: *min,
                max: *max,
                exclusive: *exclusive,
            },
            RuleCheck::AllowedValues { values } => Check::AllowedValues(values.clone()),
            RuleCheck::Regex { pattern } => Check::Regex(
                Regex::new(pattern).map_err(|e| format!("rule '{}': invalid regex: {e}", rule.name))?,
            ),
        };
        Ok(Self {
            name: rule.name.clone(),
            field: rule.field.clone(),
            severity: rule.severity,
            check,
        })
    }

    /// `Some(message)` when `record` violates the rule. Only `not_null`
    /// fails on a missing or null value.
    pub(crate) fn evaluate(&self, record: &Record) -> Option<String> {
        let field = &self.field;
        let value = match record.get(field) {
            None | Some(Value::Null) => {
                return matches!(self.check, Check::NotNull)
                    .then(|| format!("'{field}' is null or missing"));
            }
            Some(value) => value,
        };

        match &self.check {
            Check::NotNull => None,
            Check::Range {
                min,
                max,
                exclusive,
            } => {
                let Some(n) = value.as_f64() else {
                    return Some(format!("'{field}' is not numeric"));
                };
                let below = min.is_some_and(|m| if *exclusive { n <= m } else { n < m });
                let above = max.is_some_and(|m| if *exclusive { n >= m } else { n > m });
                (below || above).then(|| format!("'{field}' = {n} is out of range"))
            }
            Check::AllowedValues(values) => (!values.contains(value))
                .then(|| format!("'{field}' = {value} is not an allowed value")),
            Check::Regex(re) => match value.as_str() {
                Some(s) if re.is_match(s) => None,
                Some(s) => Some(format!("'{field}' = {s:?} does not match /{}/", re.as_str())),
                None => Some(format!("'{field}' is not a string")),
            },
        }
    }
}
