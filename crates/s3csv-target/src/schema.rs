//! Per-run schema registry
//!
//! Holds the latest schema, key properties and compiled validator for each
//! stream. A later SCHEMA message for the same stream replaces the entry.

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, TargetError};

/// `multipleOf` constraints with this many digits or more are too precise to
/// check reliably with floating point
pub const MAX_MULTIPLE_OF_DIGITS: usize = 15;

/// One reason a record does not match its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub message: String,
    /// Path of the offending value inside the record
    pub path: String,
    /// Raised by an over-precise `multipleOf` constraint
    pub precision: bool,
}

pub struct StreamSchema {
    pub schema: Value,
    pub key_properties: Vec<String>,
    validator: Validator,
}

impl StreamSchema {
    pub fn compile(stream: &str, schema: Value, key_properties: Vec<String>) -> Result<Self> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .should_validate_formats(true)
            .build(&schema)
            .map_err(|e| TargetError::InvalidSchema {
                stream: stream.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            schema,
            key_properties,
            validator,
        })
    }

    /// Every way `record` violates the schema; empty when it is valid
    pub fn validate(&self, record: &Value) -> Vec<ValidationFailure> {
        self.validator
            .iter_errors(record)
            .map(|e| ValidationFailure {
                precision: matches!(
                    e.kind,
                    ValidationErrorKind::MultipleOf { multiple_of } if decimal_digits(multiple_of) >= MAX_MULTIPLE_OF_DIGITS
                ),
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect()
    }
}

/// Digits in the plain decimal form of `value`, leading integer zero excluded
fn decimal_digits(value: f64) -> usize {
    let repr = value.abs().to_string();
    let digits = repr.chars().filter(char::is_ascii_digit).count();
    if repr.starts_with("0.") {
        digits - 1
    } else {
        digits
    }
}

#[derive(Default)]
pub struct SchemaRegistry {
    streams: HashMap<String, StreamSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and store the schema for `stream`, replacing any previous one
    pub fn register(&mut self, stream: &str, schema: Value, key_properties: Vec<String>) -> Result<()> {
        let compiled = StreamSchema::compile(stream, schema, key_properties)?;
        let replaced = self.streams.insert(stream.to_string(), compiled).is_some();
        debug!(stream, replaced, "Registered schema");
        Ok(())
    }

    pub fn get(&self, stream: &str) -> Option<&StreamSchema> {
        self.streams.get(stream)
    }

    pub fn contains(&self, stream: &str) -> bool {
        self.streams.contains_key(stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": ["null", "string"]}
            }
        })
    }

    #[test]
    fn test_valid_record_has_no_failures() {
        let compiled = StreamSchema::compile("t", schema(), vec![]).unwrap();
        assert!(compiled.validate(&json!({"id": 1, "name": "x"})).is_empty());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let compiled = StreamSchema::compile("t", schema(), vec![]).unwrap();
        let failures = compiled.validate(&json!({"id": "one"}));

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "/id");
        assert!(!failures[0].precision);
    }

    #[test]
    fn test_over_precise_multiple_of_is_flagged() {
        let schema = json!({
            "type": "object",
            "properties": {"amount": {"type": "number", "multipleOf": 0.000000000000001}}
        });
        let compiled = StreamSchema::compile("t", schema, vec![]).unwrap();
        let failures = compiled.validate(&json!({"amount": 0.1234567890123456789}));

        assert!(failures.iter().any(|f| f.precision), "{failures:?}");
    }

    #[test]
    fn test_ordinary_multiple_of_failure_is_not_precision() {
        let schema = json!({
            "type": "object",
            "properties": {"amount": {"type": "number", "multipleOf": 0.01}}
        });
        let compiled = StreamSchema::compile("t", schema, vec![]).unwrap();
        let failures = compiled.validate(&json!({"amount": 0.123}));

        assert_eq!(failures.len(), 1);
        assert!(!failures[0].precision);
    }

    #[test]
    fn test_decimal_digits() {
        assert_eq!(decimal_digits(0.01), 2);
        assert_eq!(decimal_digits(123.456), 6);
        assert_eq!(decimal_digits(0.000000000000001), 15);
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let err = StreamSchema::compile("t", json!({"type": 12}), vec![]).err().unwrap();
        assert!(matches!(err, TargetError::InvalidSchema { .. }));
    }

    #[test]
    fn test_later_schema_replaces_earlier() {
        let mut registry = SchemaRegistry::new();
        registry.register("t", schema(), vec!["id".to_string()]).unwrap();
        registry
            .register("t", json!({"type": "object"}), vec![])
            .unwrap();

        assert_eq!(registry.len(), 1);
        let current = registry.get("t").unwrap();
        assert!(current.key_properties.is_empty());
        assert!(current.validate(&json!({"id": "one"})).is_empty());
        assert!(!registry.contains("other"));
    }
}
