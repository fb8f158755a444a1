//! Quality validator: completeness, uniqueness, validity and consistency checks.

use crate::quality::types::{
    CheckKind, IssueType, QualityCheck, QualityChecks, QualityIssue, QualityReport, Severity,
};
use crate::transform::steps::canonical_form;
use crate::transform::types::{ProcessedData, ValueKind};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Missing-rate above which a field gets a warning.
const MISSING_WARNING_RATE: f64 = 0.1;
/// Missing-rate above which a field gets an error.
const MISSING_ERROR_RATE: f64 = 0.5;
/// Share of affected records above which duplicates and validation errors are errors.
const ERROR_SHARE: f64 = 0.1;

/// Runs the four quality checks over a transformed batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityValidator;

impl QualityValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, batch: &[ProcessedData]) -> QualityReport {
        let mut issues = Vec::new();
        let completeness = check_completeness(batch, &mut issues);
        let uniqueness = check_uniqueness(batch, &mut issues);
        let validity = check_validity(batch, &mut issues);
        let consistency = check_consistency(batch, &mut issues);

        let mean =
            (completeness.score + uniqueness.score + validity.score + consistency.score) / 4.0;

        QualityReport {
            overall_score: mean.round(),
            total_records: batch.len(),
            valid_records: validity.passing_records,
            invalid_records: batch.len() - validity.passing_records,
            checks: QualityChecks {
                completeness,
                uniqueness,
                validity,
                consistency,
            },
            issues,
            generated_at: Utc::now(),
        }
    }
}

fn score(passing: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let raw = 100.0 * passing as f64 / total as f64;
    (raw * 100.0).round() / 100.0
}

fn finish(
    kind: CheckKind,
    passing: usize,
    total: usize,
    issues: &[QualityIssue],
    first_issue: usize,
) -> QualityCheck {
    QualityCheck {
        kind,
        score: score(passing, total),
        passing_records: passing,
        total_records: total,
        passed: !issues[first_issue..]
            .iter()
            .any(|i| i.severity == Severity::Error),
        details: format!("{passing} of {total} records passed {kind}"),
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn check_completeness(batch: &[ProcessedData], issues: &mut Vec<QualityIssue>) -> QualityCheck {
    let first_issue = issues.len();
    let total = batch.len();

    let fields: BTreeSet<&String> = batch.iter().flat_map(|d| d.transformed.keys()).collect();
    let mut missing: BTreeMap<&String, usize> = BTreeMap::new();
    let mut complete = 0;

    for data in batch {
        let mut record_complete = true;
        for field in &fields {
            if is_missing(data.transformed.get(*field)) {
                record_complete = false;
                *missing.entry(*field).or_default() += 1;
            }
        }
        if record_complete {
            complete += 1;
        }
    }

    for (field, count) in missing {
        let rate = count as f64 / total as f64;
        if rate <= MISSING_WARNING_RATE {
            continue;
        }
        let severity = if rate > MISSING_ERROR_RATE {
            Severity::Error
        } else {
            Severity::Warning
        };
        issues.push(QualityIssue {
            check: CheckKind::Completeness,
            issue_type: IssueType::MissingValues,
            severity,
            field: Some(field.clone()),
            message: format!(
                "Field '{}' is missing in {} of {} records ({:.1}%)",
                field,
                count,
                total,
                rate * 100.0
            ),
            affected_records: count,
            recommendation: format!(
                "Provide a default for '{field}' or make the source populate it"
            ),
        });
    }

    finish(CheckKind::Completeness, complete, total, issues, first_issue)
}

fn check_uniqueness(batch: &[ProcessedData], issues: &mut Vec<QualityIssue>) -> QualityCheck {
    let first_issue = issues.len();
    let total = batch.len();
    let unique: HashSet<String> = batch
        .iter()
        .map(|d| canonical_form(&d.transformed))
        .collect();
    let duplicates = total - unique.len();

    if duplicates > 0 {
        let severity = if duplicates as f64 > total as f64 * ERROR_SHARE {
            Severity::Error
        } else {
            Severity::Warning
        };
        issues.push(QualityIssue {
            check: CheckKind::Uniqueness,
            issue_type: IssueType::DuplicateRecords,
            severity,
            field: None,
            message: format!("Found {duplicates} duplicate records out of {total}"),
            affected_records: duplicates,
            recommendation: "Add a deduplicate step to the transformation chain".to_string(),
        });
    }

    finish(CheckKind::Uniqueness, unique.len(), total, issues, first_issue)
}

fn check_validity(batch: &[ProcessedData], issues: &mut Vec<QualityIssue>) -> QualityCheck {
    let first_issue = issues.len();
    let total = batch.len();
    let valid = batch.iter().filter(|d| d.errors.is_empty()).count();

    // Count each distinct message once per record.
    let mut by_message: BTreeMap<&str, usize> = BTreeMap::new();
    for data in batch {
        let distinct: BTreeSet<&str> = data.errors.iter().map(String::as_str).collect();
        for message in distinct {
            *by_message.entry(message).or_default() += 1;
        }
    }

    for (message, count) in by_message {
        let severity = if count as f64 > total as f64 * ERROR_SHARE {
            Severity::Error
        } else {
            Severity::Warning
        };
        issues.push(QualityIssue {
            check: CheckKind::Validity,
            issue_type: IssueType::ValidationFailure,
            severity,
            field: None,
            message: format!("{message} ({count} records)"),
            affected_records: count,
            recommendation: "Fix the source data or relax the validation rule".to_string(),
        });
    }

    finish(CheckKind::Validity, valid, total, issues, first_issue)
}

fn check_consistency(batch: &[ProcessedData], issues: &mut Vec<QualityIssue>) -> QualityCheck {
    let first_issue = issues.len();
    let total = batch.len();

    let mut types: BTreeMap<&String, BTreeSet<ValueKind>> = BTreeMap::new();
    for data in batch {
        for (field, value) in &data.transformed {
            if !value.is_null() {
                types.entry(field).or_default().insert(ValueKind::of(value));
            }
        }
    }

    let mixed: BTreeMap<&String, &BTreeSet<ValueKind>> = types
        .iter()
        .filter(|(_, kinds)| kinds.len() > 1)
        .map(|(field, kinds)| (*field, kinds))
        .collect();

    let consistent = batch
        .iter()
        .filter(|d| !d.transformed.keys().any(|k| mixed.contains_key(k)))
        .count();

    for (field, kinds) in &mixed {
        let affected = batch
            .iter()
            .filter(|d| d.transformed.get(*field).is_some_and(|v| !v.is_null()))
            .count();
        let names: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
        issues.push(QualityIssue {
            check: CheckKind::Consistency,
            issue_type: IssueType::TypeInconsistency,
            severity: Severity::Warning,
            field: Some((*field).clone()),
            message: format!("Field '{}' has mixed types: {}", field, names.join(", ")),
            affected_records: affected,
            recommendation: format!("Add a validate step enforcing a single type for '{field}'"),
        });
    }

    finish(CheckKind::Consistency, consistent, total, issues, first_issue)
}
