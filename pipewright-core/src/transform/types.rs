//! Transformation type definitions.
//!
//! Defines records, transformation steps with their type-specific
//! configuration, validation rules, sort keys and the per-record
//! `ProcessedData` carried through a chain run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A single data record: a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// A single stage of the transform phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationStep {
    pub id: String,
    pub name: String,
    /// Position in the execution sequence; lower runs first.
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub operation: StepOperation,
}

fn default_enabled() -> bool {
    true
}

impl TransformationStep {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        order: i32,
        operation: StepOperation,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
            enabled: true,
            operation,
        }
    }

    pub fn step_type(&self) -> StepType {
        self.operation.step_type()
    }
}

/// Type-specific configuration of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOperation {
    /// Keep records for which the expression evaluates to true.
    Filter { expression: String },
    /// Rename fields per a `{new_field: old_field}` table.
    Map { mappings: BTreeMap<String, String> },
    /// Annotate records that break any of the rules.
    Validate { rules: Vec<FieldRule> },
    /// Drop structurally identical records, keeping the first.
    Deduplicate,
    /// Stable multi-key sort.
    Sort { keys: Vec<SortKey> },
}

impl StepOperation {
    pub fn step_type(&self) -> StepType {
        match self {
            StepOperation::Filter { .. } => StepType::Filter,
            StepOperation::Map { .. } => StepType::Map,
            StepOperation::Validate { .. } => StepType::Validate,
            StepOperation::Deduplicate => StepType::Deduplicate,
            StepOperation::Sort { .. } => StepType::Sort,
        }
    }
}

/// Step kind without its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Filter,
    Map,
    Validate,
    Deduplicate,
    Sort,
}

impl StepType {
    /// Whether the step looks at one record at a time. Record-local steps may
    /// run chunk by chunk; the others need the whole batch.
    pub fn is_record_local(&self) -> bool {
        matches!(self, StepType::Filter | StepType::Map | StepType::Validate)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Filter => write!(f, "filter"),
            StepType::Map => write!(f, "map"),
            StepType::Validate => write!(f, "validate"),
            StepType::Deduplicate => write!(f, "deduplicate"),
            StepType::Sort => write!(f, "sort"),
        }
    }
}

/// A validation rule bound to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    #[serde(flatten)]
    pub check: RuleCheck,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, check: RuleCheck) -> Self {
        Self {
            field: field.into(),
            check,
        }
    }
}

/// The check a `FieldRule` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleCheck {
    Required,
    Type {
        expected: ValueKind,
    },
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Pattern {
        pattern: String,
    },
    Enum {
        values: Vec<Value>,
    },
}

/// Runtime type of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Boolean => write!(f, "boolean"),
            ValueKind::Number => write!(f, "number"),
            ValueKind::String => write!(f, "string"),
            ValueKind::Array => write!(f, "array"),
            ValueKind::Object => write!(f, "object"),
        }
    }
}

/// One key of a multi-key sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A record as it moves through one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedData {
    pub original: Record,
    pub transformed: Record,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ProcessedData {
    pub fn new(record: Record) -> Self {
        Self {
            transformed: record.clone(),
            original: record,
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Attach a validation error and mark the record invalid.
    pub fn reject(&mut self, error: impl Into<String>) {
        self.valid = false;
        self.errors.push(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_serde_filter() {
        let step: TransformationStep = serde_json::from_value(json!({
            "id": "s1",
            "name": "big orders",
            "order": 2,
            "type": "filter",
            "expression": "amount > 100"
        }))
        .unwrap();
        assert!(step.enabled);
        assert_eq!(step.order, 2);
        assert_eq!(step.step_type(), StepType::Filter);
        assert_eq!(
            step.operation,
            StepOperation::Filter {
                expression: "amount > 100".into()
            }
        );
    }

    #[test]
    fn test_step_serde_deduplicate_unit_variant() {
        let step: TransformationStep = serde_json::from_value(json!({
            "id": "d",
            "name": "dedupe",
            "type": "deduplicate",
            "enabled": false
        }))
        .unwrap();
        assert!(!step.enabled);
        assert_eq!(step.operation, StepOperation::Deduplicate);
    }

    #[test]
    fn test_field_rule_serde() {
        let rules: Vec<FieldRule> = serde_json::from_value(json!([
            { "field": "email", "rule": "required" },
            { "field": "age", "rule": "range", "min": 0, "max": 130 },
            { "field": "age", "rule": "type", "expected": "number" },
            { "field": "tier", "rule": "enum", "values": ["gold", "silver"] }
        ]))
        .unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].check, RuleCheck::Required);
        assert_eq!(
            rules[1].check,
            RuleCheck::Range {
                min: Some(0.0),
                max: Some(130.0)
            }
        );
        assert_eq!(
            rules[2].check,
            RuleCheck::Type {
                expected: ValueKind::Number
            }
        );
    }

    #[test]
    fn test_sort_direction_default_is_asc() {
        let key: SortKey = serde_json::from_value(json!({ "field": "name" })).unwrap();
        assert_eq!(key.direction, SortDirection::Asc);
    }

    #[test]
    fn test_step_type_display() {
        assert_eq!(StepType::Filter.to_string(), "filter");
        assert_eq!(StepType::Deduplicate.to_string(), "deduplicate");
        assert!(StepType::Map.is_record_local());
        assert!(!StepType::Sort.is_record_local());
    }

    #[test]
    fn test_processed_data_reject() {
        let mut record = Record::new();
        record.insert("a".into(), json!(1));
        let mut data = ProcessedData::new(record);
        assert!(data.valid);
        data.reject("a is wrong");
        assert!(!data.valid);
        assert_eq!(data.errors, vec!["a is wrong".to_string()]);
    }
}
