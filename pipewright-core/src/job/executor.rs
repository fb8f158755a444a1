//! Job executor. Runs one attempt of a pipeline through extract, transform,
//! validate, gate and load, checkpointing the job after every phase.
//!
//! Cancellation is checked between phases only. Extractor and loader calls
//! always run to completion, so a load that has started is never cut short.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::job::types::{LogLevel, PipelineJob};
use crate::pipeline::{EndpointDescriptor, JobRepository, Pipeline};
use crate::quality::{QualityReport, QualityValidator};
use crate::transform::{ProcessedData, Record, TransformationChain};

/// Reads records from a pipeline's source.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, source: &EndpointDescriptor) -> Result<Vec<Record>, JobError>;
}

/// Writes records to a pipeline's destination.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        records: Vec<Record>,
        destination: &EndpointDescriptor,
    ) -> Result<(), JobError>;
}

/// What one attempt produced.
#[derive(Debug)]
pub struct JobRun {
    /// Present once the validate phase has run.
    pub quality: Option<QualityReport>,
    pub outcome: Result<(), JobError>,
}

pub struct JobExecutor {
    extractor: Arc<dyn Extractor>,
    loader: Arc<dyn Loader>,
    jobs: Arc<dyn JobRepository>,
    validator: QualityValidator,
    default_quality_threshold: f64,
    max_batch_size: usize,
}

impl JobExecutor {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        loader: Arc<dyn Loader>,
        jobs: Arc<dyn JobRepository>,
        default_quality_threshold: f64,
        max_batch_size: usize,
    ) -> Self {
        Self {
            extractor,
            loader,
            jobs,
            validator: QualityValidator::new(),
            default_quality_threshold,
            max_batch_size,
        }
    }

    /// Run one attempt of `job`, which must already be marked running.
    ///
    /// On return the job is completed, failed or cancelled and has been
    /// saved to the job repository. Run counters and retries are the
    /// caller's concern.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        job: &mut PipelineJob,
        source_data: Option<Vec<Record>>,
        cancel: &CancellationToken,
    ) -> JobRun {
        let mut quality = None;
        let outcome = self
            .run_phases(pipeline, job, source_data, cancel, &mut quality)
            .await;

        match &outcome {
            Ok(()) => {
                job.complete();
                job.log(
                    LogLevel::Info,
                    format!(
                        "Job completed: {} processed, {} loaded, {} failed validation",
                        job.records_processed, job.records_loaded, job.records_failed
                    ),
                );
                info!(
                    pipeline_id = %pipeline.id,
                    job_id = %job.id,
                    records_loaded = job.records_loaded,
                    dry_run = job.dry_run,
                    "Job completed"
                );
            }
            Err(JobError::Cancelled) => {
                job.cancel();
                job.log(LogLevel::Warn, "Job cancelled");
                warn!(pipeline_id = %pipeline.id, job_id = %job.id, "Job cancelled");
            }
            Err(e) => {
                job.fail();
                job.log(LogLevel::Error, format!("{} phase failed: {}", e.phase(), e));
                error!(
                    pipeline_id = %pipeline.id,
                    job_id = %job.id,
                    phase = e.phase(),
                    error = %e,
                    "Job failed"
                );
            }
        }
        self.checkpoint(job).await;

        JobRun { quality, outcome }
    }

    async fn run_phases(
        &self,
        pipeline: &Pipeline,
        job: &mut PipelineJob,
        source_data: Option<Vec<Record>>,
        cancel: &CancellationToken,
        quality: &mut Option<QualityReport>,
    ) -> Result<(), JobError> {
        // Extract
        ensure_active(cancel)?;
        self.enter_phase(pipeline, job, "extract").await;
        let records = match source_data {
            Some(records) => {
                job.log(
                    LogLevel::Info,
                    format!("Using {} provided source records", records.len()),
                );
                records
            }
            None => {
                let source = pipeline
                    .config
                    .source
                    .as_ref()
                    .ok_or_else(|| JobError::Extraction {
                        message: "pipeline has no source".to_string(),
                    })?;
                // A cancel request during the call is seen at the next phase boundary.
                self.extractor.extract(source).await?
            }
        };
        job.records_processed = records.len();
        job.set_progress(10);
        job.log(
            LogLevel::Info,
            format!("Extracted {} records", records.len()),
        );
        info!(
            pipeline_id = %pipeline.id,
            job_id = %job.id,
            phase = "extract",
            records = records.len(),
            "Extraction complete"
        );
        self.checkpoint(job).await;

        // Transform
        ensure_active(cancel)?;
        self.enter_phase(pipeline, job, "transform").await;
        let chain = TransformationChain::new(&pipeline.config.transformations).map_err(|e| {
            JobError::Transformation {
                message: e.to_string(),
            }
        })?;
        let batch: Vec<ProcessedData> = records.into_iter().map(ProcessedData::new).collect();
        let transformed = chain.apply_chunked(batch, self.max_batch_size, |progress| {
            job.current_step = Some(progress.step_id.to_string());
            job.set_progress((10 + 70 * progress.completed / progress.total.max(1)) as u8);
            job.log(
                LogLevel::Debug,
                format!(
                    "Step '{}' ({}) left {} records",
                    progress.step_name, progress.step_type, progress.records_out
                ),
            );
        });
        job.set_progress(80);
        job.current_step = Some("transform".to_string());
        job.log(
            LogLevel::Info,
            format!(
                "Applied {} transformation steps, {} records remain",
                chain.len(),
                transformed.len()
            ),
        );
        self.checkpoint(job).await;

        // Validate
        ensure_active(cancel)?;
        self.enter_phase(pipeline, job, "validate").await;
        let report = self.validator.validate(&transformed);
        job.records_failed = report.invalid_records;
        job.set_progress(90);
        job.log(
            LogLevel::Info,
            format!(
                "Quality score {} ({} valid, {} invalid, {} issues)",
                report.overall_score,
                report.valid_records,
                report.invalid_records,
                report.issues.len()
            ),
        );
        info!(
            pipeline_id = %pipeline.id,
            job_id = %job.id,
            phase = "validate",
            score = report.overall_score,
            "Quality report generated"
        );
        let score = report.overall_score;
        *quality = Some(report);
        self.checkpoint(job).await;

        // Gate
        let threshold = pipeline.quality_threshold(self.default_quality_threshold);
        if score < threshold {
            if !job.dry_run {
                return Err(JobError::QualityThreshold { score, threshold });
            }
            job.log(
                LogLevel::Warn,
                format!("Dry run: quality score {score} is below the threshold of {threshold}"),
            );
        }

        // Load
        ensure_active(cancel)?;
        self.enter_phase(pipeline, job, "load").await;
        let valid: Vec<Record> = transformed
            .into_iter()
            .filter(|d| d.valid)
            .map(|d| d.transformed)
            .collect();
        if job.dry_run {
            job.log(
                LogLevel::Info,
                format!("Dry run: skipped loading {} records", valid.len()),
            );
        } else {
            let destination =
                pipeline
                    .config
                    .destination
                    .as_ref()
                    .ok_or_else(|| JobError::Load {
                        message: "pipeline has no destination".to_string(),
                    })?;
            let count = valid.len();
            self.loader.load(valid, destination).await?;
            job.records_loaded = count;
            job.log(LogLevel::Info, format!("Loaded {count} records"));
            info!(
                pipeline_id = %pipeline.id,
                job_id = %job.id,
                phase = "load",
                records = count,
                "Load complete"
            );
        }
        job.set_progress(95);
        Ok(())
    }

    async fn enter_phase(&self, pipeline: &Pipeline, job: &mut PipelineJob, phase: &str) {
        job.current_step = Some(phase.to_string());
        job.log(LogLevel::Debug, format!("Starting {phase} phase"));
        tracing::debug!(pipeline_id = %pipeline.id, job_id = %job.id, phase, "Phase started");
        self.checkpoint(job).await;
    }

    async fn checkpoint(&self, job: &PipelineJob) {
        if let Err(e) = self.jobs.save_job(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to checkpoint job");
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::types::{JobStatus, TriggeredBy};
    use crate::pipeline::{InMemoryRepository, PipelineConfig, PipelineStatus};
    use crate::transform::{FieldRule, RuleCheck, StepOperation, TransformationStep};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct StaticExtractor(Vec<Record>);

    #[async_trait]
    impl Extractor for StaticExtractor {
        async fn extract(&self, _source: &EndpointDescriptor) -> Result<Vec<Record>, JobError> {
            Ok(self.0.clone())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl Extractor for FailingExtractor {
        async fn extract(&self, _source: &EndpointDescriptor) -> Result<Vec<Record>, JobError> {
            Err(JobError::Extraction {
                message: "connection refused".into(),
            })
        }
    }

    /// Takes a while to answer and records whether it got to finish.
    #[derive(Default)]
    struct SlowExtractor {
        finished: AtomicBool,
    }

    #[async_trait]
    impl Extractor for SlowExtractor {
        async fn extract(&self, _source: &EndpointDescriptor) -> Result<Vec<Record>, JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(records(vec![json!({"id": 1})]))
        }
    }

    #[derive(Default)]
    struct SlowLoader {
        finished: AtomicBool,
    }

    #[async_trait]
    impl Loader for SlowLoader {
        async fn load(
            &self,
            _records: Vec<Record>,
            _destination: &EndpointDescriptor,
        ) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingLoader {
        batches: Mutex<Vec<Vec<Record>>>,
    }

    #[async_trait]
    impl Loader for RecordingLoader {
        async fn load(
            &self,
            records: Vec<Record>,
            _destination: &EndpointDescriptor,
        ) -> Result<(), JobError> {
            self.batches.lock().await.push(records);
            Ok(())
        }
    }

    fn records(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn pipeline(steps: Vec<TransformationStep>, threshold: Option<f64>) -> Pipeline {
        let mut config = PipelineConfig::new(
            "orders",
            EndpointDescriptor::new("memory"),
            EndpointDescriptor::new("memory"),
        );
        config.transformations = steps;
        config.quality_threshold = threshold;
        Pipeline::new(config, PipelineStatus::Active)
    }

    fn amount_filter() -> TransformationStep {
        TransformationStep::new(
            "large",
            "Large orders",
            1,
            StepOperation::Filter {
                expression: "amount > 100".into(),
            },
        )
    }

    fn setup(
        extractor: Arc<dyn Extractor>,
    ) -> (JobExecutor, Arc<RecordingLoader>, Arc<InMemoryRepository>) {
        let loader = Arc::new(RecordingLoader::default());
        let repo = Arc::new(InMemoryRepository::new());
        let executor = JobExecutor::new(extractor, loader.clone(), repo.clone(), 80.0, 2);
        (executor, loader, repo)
    }

    fn running_job(pipeline: &Pipeline, dry_run: bool) -> PipelineJob {
        let mut job = PipelineJob::new(pipeline.id, TriggeredBy::Manual, dry_run);
        job.start();
        job
    }

    #[tokio::test]
    async fn test_filter_and_load() {
        let source = records(vec![
            json!({"id": 1, "amount": 50}),
            json!({"id": 2, "amount": 150}),
            json!({"id": 3, "amount": 200}),
        ]);
        let (executor, loader, repo) = setup(Arc::new(StaticExtractor(source)));
        let pipeline = pipeline(vec![amount_filter()], None);
        let mut job = running_job(&pipeline, false);

        let run = executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await;
        assert!(run.outcome.is_ok());
        assert_eq!(run.quality.unwrap().overall_score, 100.0);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.records_processed, 3);
        assert_eq!(job.records_loaded, 2);

        let batches = loader.batches.lock().await;
        assert_eq!(batches.len(), 1);
        let amounts: Vec<&Value> = batches[0].iter().map(|r| &r["amount"]).collect();
        assert_eq!(amounts, vec![&json!(150), &json!(200)]);

        let saved = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Completed);
        for phase in ["extract", "transform", "validate", "load"] {
            assert!(
                job.logs.iter().any(|l| l.step.as_deref() == Some(phase)),
                "missing {phase} log"
            );
        }
    }

    #[tokio::test]
    async fn test_provided_source_data_skips_extractor() {
        let (executor, loader, _) = setup(Arc::new(FailingExtractor));
        let pipeline = pipeline(vec![], None);
        let mut job = running_job(&pipeline, false);
        let data = records(vec![json!({"id": 1})]);

        let run = executor
            .run(&pipeline, &mut job, Some(data), &CancellationToken::new())
            .await;
        assert!(run.outcome.is_ok());
        assert_eq!(loader.batches.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_records_are_not_loaded() {
        let source = records(vec![
            json!({"id": 1, "email": "a@x.io"}),
            json!({"id": 2, "email": "b@x.io"}),
            json!({"id": 3}),
        ]);
        let (executor, loader, _) = setup(Arc::new(StaticExtractor(source)));
        let validate = TransformationStep::new(
            "checks",
            "Checks",
            1,
            StepOperation::Validate {
                rules: vec![FieldRule::new("email", RuleCheck::Required)],
            },
        );
        let pipeline = pipeline(vec![validate], Some(0.0));
        let mut job = running_job(&pipeline, false);

        let run = executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await;
        assert!(run.outcome.is_ok());
        assert_eq!(job.records_failed, 1);
        assert_eq!(job.records_loaded, 2);
        assert_eq!(loader.batches.lock().await[0].len(), 2);
    }

    #[tokio::test]
    async fn test_quality_gate_blocks_load() {
        let source = records(vec![
            json!({"id": 1, "email": null}),
            json!({"id": 2, "email": null}),
        ]);
        let (executor, loader, _) = setup(Arc::new(StaticExtractor(source)));
        let pipeline = pipeline(vec![], Some(95.0));
        let mut job = running_job(&pipeline, false);

        let run = executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await;
        assert!(matches!(
            run.outcome,
            Err(JobError::QualityThreshold { threshold, .. }) if threshold == 95.0
        ));
        assert!(run.quality.is_some());
        assert_eq!(job.status, JobStatus::Failed);
        assert!(loader.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_gate_and_load() {
        let source = records(vec![json!({"id": 1, "email": null})]);
        let (executor, loader, _) = setup(Arc::new(StaticExtractor(source)));
        let pipeline = pipeline(vec![], Some(95.0));
        let mut job = running_job(&pipeline, true);

        let run = executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await;
        assert!(run.outcome.is_ok());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.records_loaded, 0);
        assert!(loader.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure() {
        let (executor, _, repo) = setup(Arc::new(FailingExtractor));
        let pipeline = pipeline(vec![], None);
        let mut job = running_job(&pipeline, false);

        let run = executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await;
        assert!(matches!(run.outcome, Err(JobError::Extraction { .. })));
        assert!(run.quality.is_none());
        let saved = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Failed);
        assert_eq!(saved.logs.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (executor, loader, _) = setup(Arc::new(StaticExtractor(vec![])));
        let pipeline = pipeline(vec![], None);
        let mut job = running_job(&pipeline, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = executor.run(&pipeline, &mut job, None, &cancel).await;
        assert_eq!(run.outcome, Err(JobError::Cancelled));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(loader.batches.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_extraction_stops_at_next_phase() {
        let extractor = Arc::new(SlowExtractor::default());
        let (executor, loader, _) = setup(extractor.clone());
        let pipeline = pipeline(vec![], None);
        let mut job = running_job(&pipeline, false);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let (run, _) = tokio::join!(executor.run(&pipeline, &mut job, None, &cancel), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert!(extractor.finished.load(Ordering::SeqCst));
        assert_eq!(run.outcome, Err(JobError::Cancelled));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.records_processed, 1);
        assert!(run.quality.is_none());
        assert!(loader.batches.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_load_lets_load_finish() {
        let loader = Arc::new(SlowLoader::default());
        let repo = Arc::new(InMemoryRepository::new());
        let source = records(vec![json!({"id": 1}), json!({"id": 2})]);
        let executor = JobExecutor::new(
            Arc::new(StaticExtractor(source)),
            loader.clone(),
            repo,
            80.0,
            2,
        );
        let pipeline = pipeline(vec![], None);
        let mut job = running_job(&pipeline, false);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let (run, _) = tokio::join!(executor.run(&pipeline, &mut job, None, &cancel), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert!(cancel.is_cancelled());
        assert!(loader.finished.load(Ordering::SeqCst));
        assert!(run.outcome.is_ok());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.records_loaded, 2);
    }

    #[tokio::test]
    async fn test_chunked_transform_reports_step_progress() {
        let source = records((0..5).map(|i| json!({"id": i, "amount": i * 100})).collect());
        let (executor, _, _) = setup(Arc::new(StaticExtractor(source)));
        let sort = TransformationStep::new(
            "sort",
            "Sort",
            2,
            StepOperation::Sort {
                keys: vec![crate::transform::SortKey::desc("amount")],
            },
        );
        let pipeline = pipeline(vec![amount_filter(), sort], None);
        let mut job = running_job(&pipeline, false);

        executor
            .run(&pipeline, &mut job, None, &CancellationToken::new())
            .await
            .outcome
            .unwrap();
        assert_eq!(job.records_loaded, 3);
        let step_logs: Vec<&str> = job
            .logs
            .iter()
            .filter(|l| l.level == LogLevel::Debug)
            .filter_map(|l| l.step.as_deref())
            .filter(|s| *s == "large" || *s == "sort")
            .collect();
        assert_eq!(step_logs, vec!["large", "sort"]);
    }
}
