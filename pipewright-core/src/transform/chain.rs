//! Transformation chain. Orders enabled steps and applies them to a batch.

use crate::error::TransformError;
use crate::transform::expression::Expression;
use crate::transform::steps::{self, CompiledCheck, CompiledRule};
use crate::transform::types::{
    ProcessedData, Record, RuleCheck, SortKey, StepOperation, StepType, TransformationStep,
};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Progress notification emitted after each step completes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress<'a> {
    /// Number of steps completed so far (1-based).
    pub completed: usize,
    pub total: usize,
    pub step_id: &'a str,
    pub step_name: &'a str,
    pub step_type: StepType,
    /// Records left after the step.
    pub records_out: usize,
}

/// An ordered, compiled sequence of enabled transformation steps.
#[derive(Debug, Clone)]
pub struct TransformationChain {
    steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
struct CompiledStep {
    id: String,
    name: String,
    operation: CompiledOperation,
}

#[derive(Debug, Clone)]
enum CompiledOperation {
    Filter(Expression),
    Map(BTreeMap<String, String>),
    Validate(Vec<CompiledRule>),
    Deduplicate,
    Sort(Vec<SortKey>),
}

impl CompiledStep {
    fn compile(step: &TransformationStep) -> Result<Self, TransformError> {
        let operation = match &step.operation {
            StepOperation::Filter { expression } => {
                CompiledOperation::Filter(Expression::parse(expression)?)
            }
            StepOperation::Map { mappings } => CompiledOperation::Map(mappings.clone()),
            StepOperation::Validate { rules } => CompiledOperation::Validate(
                rules
                    .iter()
                    .map(|rule| {
                        Ok(CompiledRule {
                            field: rule.field.clone(),
                            check: compile_check(&rule.check)?,
                        })
                    })
                    .collect::<Result<Vec<_>, TransformError>>()?,
            ),
            StepOperation::Deduplicate => CompiledOperation::Deduplicate,
            StepOperation::Sort { keys } => CompiledOperation::Sort(keys.clone()),
        };
        Ok(Self {
            id: step.id.clone(),
            name: step.name.clone(),
            operation,
        })
    }

    fn step_type(&self) -> StepType {
        match self.operation {
            CompiledOperation::Filter(_) => StepType::Filter,
            CompiledOperation::Map(_) => StepType::Map,
            CompiledOperation::Validate(_) => StepType::Validate,
            CompiledOperation::Deduplicate => StepType::Deduplicate,
            CompiledOperation::Sort(_) => StepType::Sort,
        }
    }

    fn apply(&self, batch: Vec<ProcessedData>) -> Vec<ProcessedData> {
        match &self.operation {
            CompiledOperation::Filter(expression) => steps::filter(batch, expression),
            CompiledOperation::Map(mappings) => steps::map_fields(batch, mappings),
            CompiledOperation::Validate(rules) => steps::validate(batch, rules),
            CompiledOperation::Deduplicate => steps::deduplicate(batch),
            CompiledOperation::Sort(keys) => steps::sort(batch, keys),
        }
    }
}

fn compile_check(check: &RuleCheck) -> Result<CompiledCheck, TransformError> {
    Ok(match check {
        RuleCheck::Required => CompiledCheck::Required,
        RuleCheck::Type { expected } => CompiledCheck::Type(*expected),
        RuleCheck::Range { min, max } => CompiledCheck::Range {
            min: *min,
            max: *max,
        },
        RuleCheck::Pattern { pattern } => {
            let regex = Regex::new(pattern).map_err(|e| TransformError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            CompiledCheck::Pattern(regex)
        }
        RuleCheck::Enum { values } => CompiledCheck::Enum(values.clone()),
    })
}

impl TransformationChain {
    /// Compile the enabled steps, ordered by `order`. Steps sharing an order
    /// keep their declaration order.
    pub fn new(steps: &[TransformationStep]) -> Result<Self, TransformError> {
        let mut enabled: Vec<&TransformationStep> = steps.iter().filter(|s| s.enabled).collect();
        enabled.sort_by_key(|s| s.order);
        let steps = enabled
            .into_iter()
            .map(CompiledStep::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    /// Number of enabled steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ids of the enabled steps in execution order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Run every step over the whole batch.
    pub fn apply(&self, records: Vec<Record>) -> Vec<ProcessedData> {
        let batch = records.into_iter().map(ProcessedData::new).collect();
        self.apply_chunked(batch, 0, |_| {})
    }

    /// Run the chain with bounded chunks.
    ///
    /// Consecutive record-local steps (filter, map, validate) run chunk by
    /// chunk of at most `chunk_size` records; deduplicate and sort always see
    /// the combined batch, so the output equals the unchunked output. A
    /// `chunk_size` of zero disables chunking. `on_step` is called once per
    /// step, in order.
    pub fn apply_chunked<F>(
        &self,
        batch: Vec<ProcessedData>,
        chunk_size: usize,
        mut on_step: F,
    ) -> Vec<ProcessedData>
    where
        F: FnMut(StepProgress<'_>),
    {
        let chunk_size = if chunk_size == 0 { usize::MAX } else { chunk_size };
        let total = self.steps.len();
        let mut current = batch;
        let mut idx = 0;

        while idx < total {
            let end = if self.steps[idx].step_type().is_record_local() {
                self.steps[idx..]
                    .iter()
                    .position(|s| !s.step_type().is_record_local())
                    .map(|offset| idx + offset)
                    .unwrap_or(total)
            } else {
                idx + 1
            };
            let segment = &self.steps[idx..end];
            let mut counts = vec![0usize; segment.len()];

            if end - idx == 1 && !segment[0].step_type().is_record_local() {
                current = segment[0].apply(current);
                counts[0] = current.len();
            } else {
                let mut output = Vec::with_capacity(current.len());
                let mut remaining = current.into_iter();
                loop {
                    let mut chunk: Vec<ProcessedData> =
                        remaining.by_ref().take(chunk_size).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    for (k, step) in segment.iter().enumerate() {
                        chunk = step.apply(chunk);
                        counts[k] += chunk.len();
                    }
                    output.extend(chunk);
                }
                current = output;
            }

            for (k, step) in segment.iter().enumerate() {
                debug!(
                    step = %step.id,
                    step_type = %step.step_type(),
                    records = counts[k],
                    "Transformation step applied"
                );
                on_step(StepProgress {
                    completed: idx + k + 1,
                    total,
                    step_id: &step.id,
                    step_name: &step.name,
                    step_type: step.step_type(),
                    records_out: counts[k],
                });
            }
            idx = end;
        }

        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::types::FieldRule;
    use serde_json::{Value, json};

    fn records(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn filter_step(id: &str, order: i32, expression: &str) -> TransformationStep {
        TransformationStep::new(
            id,
            id,
            order,
            StepOperation::Filter {
                expression: expression.to_string(),
            },
        )
    }

    #[test]
    fn test_chain_orders_by_order_and_skips_disabled() {
        let mut disabled = filter_step("never", 0, "false");
        disabled.enabled = false;
        let steps = vec![
            TransformationStep::new("sort", "sort", 3, StepOperation::Sort {
                keys: vec![SortKey::asc("n")],
            }),
            filter_step("big", 1, "n > 1"),
            disabled,
            TransformationStep::new("dedupe", "dedupe", 2, StepOperation::Deduplicate),
        ];
        let chain = TransformationChain::new(&steps).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.step_ids(), vec!["big", "dedupe", "sort"]);

        let out = chain.apply(records(vec![
            json!({ "n": 3 }),
            json!({ "n": 1 }),
            json!({ "n": 2 }),
            json!({ "n": 3 }),
        ]));
        let ns: Vec<i64> = out
            .iter()
            .map(|d| d.transformed["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[test]
    fn test_later_step_sees_prior_output() {
        let mut mappings = BTreeMap::new();
        mappings.insert("total".to_string(), "amount".to_string());
        let steps = vec![
            TransformationStep::new("rename", "rename", 1, StepOperation::Map { mappings }),
            filter_step("big", 2, "total > 100"),
        ];
        let chain = TransformationChain::new(&steps).unwrap();
        let out = chain.apply(records(vec![json!({ "amount": 150 }), json!({ "amount": 5 })]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].transformed.get("total"), Some(&json!(150)));
        assert!(out[0].transformed.get("amount").is_none());
    }

    #[test]
    fn test_invalid_filter_expression_rejected_at_compile() {
        let steps = vec![filter_step("bad", 1, "amount >")];
        let err = TransformationChain::new(&steps).unwrap_err();
        assert!(matches!(err, TransformError::InvalidExpression { .. }));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_compile() {
        let steps = vec![TransformationStep::new(
            "v",
            "v",
            1,
            StepOperation::Validate {
                rules: vec![FieldRule::new(
                    "zip",
                    RuleCheck::Pattern {
                        pattern: "(unclosed".to_string(),
                    },
                )],
            },
        )];
        let err = TransformationChain::new(&steps).unwrap_err();
        assert!(matches!(err, TransformError::InvalidPattern { .. }));
    }

    #[test]
    fn test_chunked_matches_unchunked() {
        let steps = vec![
            filter_step("keep", 1, "n != 4"),
            TransformationStep::new("dedupe", "dedupe", 2, StepOperation::Deduplicate),
            TransformationStep::new("sort", "sort", 3, StepOperation::Sort {
                keys: vec![SortKey::desc("n")],
            }),
            filter_step("small", 4, "n < 9"),
        ];
        let chain = TransformationChain::new(&steps).unwrap();
        let input: Vec<Record> = records(
            (0..25)
                .map(|i| json!({ "n": i % 10 }))
                .collect(),
        );
        let whole = chain.apply(input.clone());
        let batch = input.into_iter().map(ProcessedData::new).collect();
        let chunked = chain.apply_chunked(batch, 4, |_| {});
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_progress_reported_per_step() {
        let steps = vec![
            filter_step("a", 1, "n > 0"),
            filter_step("b", 2, "n > 1"),
            TransformationStep::new("dedupe", "dedupe", 3, StepOperation::Deduplicate),
        ];
        let chain = TransformationChain::new(&steps).unwrap();
        let batch = records(vec![
            json!({ "n": 0 }),
            json!({ "n": 1 }),
            json!({ "n": 2 }),
            json!({ "n": 2 }),
        ])
        .into_iter()
        .map(ProcessedData::new)
        .collect();
        let mut seen = Vec::new();
        chain.apply_chunked(batch, 2, |p| {
            seen.push((p.completed, p.total, p.step_id.to_string(), p.records_out))
        });
        assert_eq!(
            seen,
            vec![
                (1, 3, "a".to_string(), 3),
                (2, 3, "b".to_string(), 2),
                (3, 3, "dedupe".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_empty_chain_passes_records_through() {
        let chain = TransformationChain::new(&[]).unwrap();
        assert!(chain.is_empty());
        let out = chain.apply(records(vec![json!({ "a": 1 })]));
        assert_eq!(out.len(), 1);
        assert!(out[0].valid);
    }
}
