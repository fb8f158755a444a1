//! Quality report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four independent data-health measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Completeness,
    Uniqueness,
    Validity,
    Consistency,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Completeness => write!(f, "completeness"),
            CheckKind::Uniqueness => write!(f, "uniqueness"),
            CheckKind::Validity => write!(f, "validity"),
            CheckKind::Consistency => write!(f, "consistency"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingValues,
    DuplicateRecords,
    ValidationFailure,
    TypeInconsistency,
}

/// Result of one quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub kind: CheckKind,
    /// Percentage of records passing the check, in [0, 100].
    pub score: f64,
    pub passing_records: usize,
    pub total_records: usize,
    /// False when the check raised an error-severity issue.
    pub passed: bool,
    pub details: String,
}

/// A problem found by a check, with a suggested fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub check: CheckKind,
    pub issue_type: IssueType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    pub affected_records: usize,
    pub recommendation: String,
}

/// The four check results by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityChecks {
    pub completeness: QualityCheck,
    pub uniqueness: QualityCheck,
    pub validity: QualityCheck,
    pub consistency: QualityCheck,
}

impl QualityChecks {
    pub fn iter(&self) -> impl Iterator<Item = &QualityCheck> {
        [
            &self.completeness,
            &self.uniqueness,
            &self.validity,
            &self.consistency,
        ]
        .into_iter()
    }
}

/// Composite report over a transformed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Rounded unweighted mean of the four check scores.
    pub overall_score: f64,
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid_records: usize,
    pub checks: QualityChecks,
    pub issues: Vec<QualityIssue>,
    pub generated_at: DateTime<Utc>,
}

impl QualityReport {
    /// Whether the report clears a gate at `threshold`.
    pub fn meets(&self, threshold: f64) -> bool {
        self.overall_score >= threshold
    }

    /// Issues at or above the given severity.
    pub fn issues_at_least(&self, severity: Severity) -> impl Iterator<Item = &QualityIssue> {
        self.issues.iter().filter(move |i| i.severity >= severity)
    }
}
