//! Step implementations: filter, map, validate, deduplicate and sort.
//!
//! Each function takes ownership of a batch and returns the batch produced by
//! the step. Validation only annotates records; filter and deduplicate are the
//! only steps that drop records.

use crate::transform::expression::Expression;
use crate::transform::types::{ProcessedData, Record, SortDirection, SortKey, ValueKind};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// A validation rule with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub field: String,
    pub check: CompiledCheck,
}

#[derive(Debug, Clone)]
pub enum CompiledCheck {
    Required,
    Type(ValueKind),
    Range { min: Option<f64>, max: Option<f64> },
    Pattern(Regex),
    Enum(Vec<Value>),
}

/// Keep the records whose transformed form satisfies the expression.
pub fn filter(batch: Vec<ProcessedData>, expression: &Expression) -> Vec<ProcessedData> {
    batch
        .into_iter()
        .filter(|data| expression.matches(&data.transformed))
        .collect()
}

/// Rename fields per a `{new_field: old_field}` table.
pub fn map_fields(
    mut batch: Vec<ProcessedData>,
    mappings: &BTreeMap<String, String>,
) -> Vec<ProcessedData> {
    for data in &mut batch {
        let source = data.transformed.clone();
        for (new_field, old_field) in mappings {
            if new_field != old_field {
                data.transformed.remove(old_field);
            }
        }
        for (new_field, old_field) in mappings {
            if let Some(value) = source.get(old_field) {
                data.transformed.insert(new_field.clone(), value.clone());
            }
        }
    }
    batch
}

/// Apply every rule to every record, attaching one error per failed rule.
pub fn validate(mut batch: Vec<ProcessedData>, rules: &[CompiledRule]) -> Vec<ProcessedData> {
    for data in &mut batch {
        for rule in rules {
            if let Some(error) = check_rule(&data.transformed, rule) {
                data.reject(error);
            }
        }
    }
    batch
}

fn check_rule(record: &Record, rule: &CompiledRule) -> Option<String> {
    let field = &rule.field;
    let value = record.get(field).filter(|v| !v.is_null());

    if let CompiledCheck::Required = rule.check {
        return match value {
            None => Some(format!("{field} is required")),
            Some(Value::String(s)) if s.is_empty() => Some(format!("{field} is required")),
            Some(_) => None,
        };
    }

    // Optional fields are only checked when present.
    let value = value?;
    match &rule.check {
        CompiledCheck::Required => None,
        CompiledCheck::Type(expected) => {
            let actual = ValueKind::of(value);
            (actual != *expected).then(|| format!("{field} must be of type {expected}"))
        }
        CompiledCheck::Range { min, max } => {
            let Some(number) = value.as_f64() else {
                return Some(format!("{field} must be a number"));
            };
            if let Some(min) = min {
                if number < *min {
                    return Some(format!("{field} must be at least {min}"));
                }
            }
            if let Some(max) = max {
                if number > *max {
                    return Some(format!("{field} must be at most {max}"));
                }
            }
            None
        }
        CompiledCheck::Pattern(regex) => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => String::new(),
            };
            (!regex.is_match(&text))
                .then(|| format!("{field} does not match pattern {}", regex.as_str()))
        }
        CompiledCheck::Enum(allowed) => {
            if allowed.contains(value) {
                None
            } else {
                let options: Vec<String> = allowed.iter().map(display_value).collect();
                Some(format!("{field} must be one of: {}", options.join(", ")))
            }
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drop records whose transformed form was already seen. First occurrence wins.
pub fn deduplicate(batch: Vec<ProcessedData>) -> Vec<ProcessedData> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch
        .into_iter()
        .filter(|data| seen.insert(canonical_form(&data.transformed)))
        .collect()
}

/// Stable multi-key sort over the transformed records.
pub fn sort(mut batch: Vec<ProcessedData>, keys: &[SortKey]) -> Vec<ProcessedData> {
    batch.sort_by(|a, b| compare_records(&a.transformed, &b.transformed, keys));
    batch
}

/// Compare two records key by key. Missing and null values sort first in
/// either direction.
pub fn compare_records(a: &Record, b: &Record, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = a.get(&key.field).filter(|v| !v.is_null());
        let right = b.get(&key.field).filter(|v| !v.is_null());
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => {
                let ordering = compare_values(left, right);
                match key.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (kind_a, kind_b) = (ValueKind::of(a), ValueKind::of(b));
    if kind_a != kind_b {
        return kind_a.cmp(&kind_b);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => canonical_value(a).cmp(&canonical_value(b)),
    }
}

/// Canonical JSON for a record: keys sorted at every level, no whitespace.
pub fn canonical_form(record: &Record) -> String {
    let mut out = String::new();
    write_object(record, &mut out);
    out
}

fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_object(map: &serde_json::Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
