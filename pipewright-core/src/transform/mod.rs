//! Transformation engine for Pipewright.
//!
//! Provides the step definitions, a sandboxed filter expression language, and
//! the chain that applies enabled steps to a record batch in order.

pub mod chain;
pub mod expression;
pub mod steps;
pub mod types;

pub use chain::{StepProgress, TransformationChain};
pub use expression::Expression;
pub use steps::canonical_form;
pub use types::{
    FieldRule, ProcessedData, Record, RuleCheck, SortDirection, SortKey, StepOperation, StepType,
    TransformationStep, ValueKind,
};
