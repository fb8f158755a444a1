//! Data-quality validation over transformed batches.

pub mod types;
pub mod validator;

pub use types::{
    CheckKind, IssueType, QualityCheck, QualityChecks, QualityIssue, QualityReport, Severity,
};
pub use validator::QualityValidator;
