//! Structural and type conformance against an entity schema.

use std::collections::BTreeMap;

use serde_json::Value;
use wmsync_types::record::Record;
use wmsync_types::validation::{IssueSeverity, ValidationError};

use crate::config::{EntitySchema, FieldSpec, FieldType};

pub(crate) const RULE_REQUIRED: &str = "schema.required";
pub(crate) const RULE_NULLABLE: &str = "schema.nullable";
pub(crate) const RULE_TYPE: &str = "schema.type";
pub(crate) const RULE_PRIMARY_KEY: &str = "schema.primary_key";

pub(crate) fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Any => true,
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Timestamp => value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// All schema violations of one record. Every violation is REJECT.
pub(crate) fn check_record(index: usize, record: &Record, schema: &EntitySchema) -> Vec<ValidationError> {
    let mut issues = Vec::new();

    for (name, spec) in &schema.fields {
        match record.get(name) {
            None if spec.required => issues.push(ValidationError::record(
                index,
                Some(name.as_str()),
                RULE_REQUIRED,
                format!("missing required field '{name}'"),
                IssueSeverity::Reject,
            )),
            None => {}
            Some(Value::Null) if !spec.nullable => issues.push(ValidationError::record(
                index,
                Some(name.as_str()),
                RULE_NULLABLE,
                format!("field '{name}' must not be null"),
                IssueSeverity::Reject,
            )),
            Some(Value::Null) => {}
            Some(value) if !type_matches(spec.field_type, value) => {
                issues.push(ValidationError::record(
                    index,
                    Some(name.as_str()),
                    RULE_TYPE,
                    format!(
                        "field '{name}' expected {}, got {}",
                        spec.field_type.as_str(),
                        json_type_name(value)
                    ),
                    IssueSeverity::Reject,
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(pk) = &schema.primary_key {
        let already_reported = issues.iter().any(|e| e.field.as_deref() == Some(pk.as_str()));
        if !already_reported {
            issues.extend(check_primary_key(index, record, pk));
        }
    }

    issues
}

/// Records without a usable key cannot be committed, schema or not.
pub(crate) fn check_primary_key(index: usize, record: &Record, primary_key: &str) -> Option<ValidationError> {
    record.get(primary_key).map_or(true, Value::is_null).then(|| {
        ValidationError::record(
            index,
            Some(primary_key),
            RULE_PRIMARY_KEY,
            format!("primary key '{primary_key}' is missing or null"),
            IssueSeverity::Reject,
        )
    })
}

/// Build a schema from a pipeline SCHEMA message (JSON-Schema `properties`,
/// `required`) and its key properties.
pub(crate) fn derive_schema(json_schema: &Value, key_properties: &[String]) -> EntitySchema {
    let required: Vec<&str> = json_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut fields = BTreeMap::new();
    if let Some(properties) = json_schema.get("properties").and_then(Value::as_object) {
        for (name, property) in properties {
            let (field_type, nullable) = derive_field_type(property);
            fields.insert(
                name.clone(),
                FieldSpec {
                    field_type,
                    required: required.contains(&name.as_str()),
                    nullable,
                },
            );
        }
    }

    EntitySchema {
        fields,
        primary_key: key_properties.first().cloned(),
    }
}

fn derive_field_type(property: &Value) -> (FieldType, bool) {
    let types: Vec<&str> = match property.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    let nullable = types.is_empty() || types.contains(&"null");
    let format = property.get("format").and_then(Value::as_str);

    let field_type = match types.iter().find(|t| **t != "null").copied() {
        Some("string") if format == Some("date-time") => FieldType::Timestamp,
        Some("string") => FieldType::String,
        Some("integer") => FieldType::Integer,
        Some("number") => FieldType::Number,
        Some("boolean") => FieldType::Boolean,
        Some("object") => FieldType::Object,
        Some("array") => FieldType::Array,
        _ => FieldType::Any,
    };
    (field_type, nullable)
}
