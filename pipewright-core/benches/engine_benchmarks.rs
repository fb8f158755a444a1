use chrono::NaiveDate;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use std::collections::BTreeMap;

use pipewright_core::quality::QualityValidator;
use pipewright_core::scheduler::CronExpression;
use pipewright_core::transform::{
    FieldRule, Record, RuleCheck, SortKey, StepOperation, TransformationChain, TransformationStep,
    ValueKind,
};

fn sample_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            json!({
                "id": i % (count / 2).max(1),
                "amount": (i * 37) % 500,
                "status": if i % 3 == 0 { "refunded" } else { "paid" },
                "email": format!("user{}@example.com", i % 97),
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect()
}

fn full_chain() -> TransformationChain {
    let steps = vec![
        TransformationStep::new(
            "paid",
            "Paid orders",
            1,
            StepOperation::Filter {
                expression: "status == 'paid' and amount >= 10".into(),
            },
        ),
        TransformationStep::new(
            "rename",
            "Rename",
            2,
            StepOperation::Map {
                mappings: BTreeMap::from([
                    ("order_id".to_string(), "id".to_string()),
                    ("total".to_string(), "amount".to_string()),
                ]),
            },
        ),
        TransformationStep::new(
            "check",
            "Check",
            3,
            StepOperation::Validate {
                rules: vec![
                    FieldRule::new("order_id", RuleCheck::Required),
                    FieldRule::new(
                        "total",
                        RuleCheck::Type {
                            expected: ValueKind::Number,
                        },
                    ),
                    FieldRule::new(
                        "email",
                        RuleCheck::Pattern {
                            pattern: r"^[^@]+@[^@]+\.[a-z]+$".into(),
                        },
                    ),
                ],
            },
        ),
        TransformationStep::new("dedup", "Dedup", 4, StepOperation::Deduplicate),
        TransformationStep::new(
            "sort",
            "Sort",
            5,
            StepOperation::Sort {
                keys: vec![SortKey::desc("total"), SortKey::asc("order_id")],
            },
        ),
    ];
    TransformationChain::new(&steps).unwrap()
}

fn bench_transformation_chain(c: &mut Criterion) {
    let chain = full_chain();
    let small = sample_records(100);
    let large = sample_records(10_000);

    c.bench_function("chain_full_100_records", |b| {
        b.iter(|| chain.apply(black_box(small.clone())))
    });

    c.bench_function("chain_full_10k_records", |b| {
        b.iter(|| chain.apply(black_box(large.clone())))
    });

    c.bench_function("chain_compile", |b| b.iter(|| black_box(full_chain())));
}

fn bench_quality_validator(c: &mut Criterion) {
    let chain = full_chain();
    let batch = chain.apply(sample_records(10_000));
    let validator = QualityValidator::new();

    c.bench_function("quality_validate_10k_records", |b| {
        b.iter(|| validator.validate(black_box(&batch)))
    });
}

fn bench_cron(c: &mut Criterion) {
    let start = NaiveDate::from_ymd_opt(2024, 3, 10)
        .and_then(|d| d.and_hms_opt(1, 30, 0))
        .unwrap();

    c.bench_function("cron_parse", |b| {
        b.iter(|| CronExpression::parse(black_box("*/15 9-17 * jan-jun mon-fri")))
    });

    let weekday = CronExpression::parse("*/15 9-17 * * mon-fri").unwrap();
    c.bench_function("cron_next_weekday", |b| {
        b.iter(|| weekday.next_from(black_box(start)))
    });

    let leap = CronExpression::parse("0 0 29 2 *").unwrap();
    c.bench_function("cron_next_leap_day", |b| {
        b.iter(|| leap.next_from(black_box(start)))
    });
}

criterion_group!(
    benches,
    bench_transformation_chain,
    bench_quality_validator,
    bench_cron,
);
criterion_main!(benches);
