//! Pipeline registry: lifecycle, scheduling, execution and retries.
//!
//! The registry is the single writer for pipelines. Every mutation of a stored
//! pipeline happens under that pipeline's async lock, and at most one job per
//! pipeline is in flight at any time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertDispatcher, AlertEvent, LoggingAlertDispatcher, dispatch_all};
use crate::config::EngineConfig;
use crate::error::{EngineError, JobError, PipelineError, Result, SchedulerError};
use crate::job::retry::{next_delay, should_retry};
use crate::job::{
    ExecuteOptions, Extractor, JobExecutor, JobStatus, LogLevel, Loader, PipelineJob,
    PipelineResult, RunError, TriggeredBy,
};
use crate::pipeline::parser::validate_pipeline_config;
use crate::pipeline::repository::{InMemoryRepository, JobRepository, PipelineRepository};
use crate::pipeline::types::{
    Frequency, Pipeline, PipelineConfig, PipelineConfigPatch, PipelineStatus, RetryConfig,
};
use crate::scheduler::{Scheduler, TimerKind, TimerTarget, calculate_next_run};
use crate::transform::Record;

/// External services the registry is built with.
pub struct Collaborators {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub extractor: Arc<dyn Extractor>,
    pub loader: Arc<dyn Loader>,
    pub alerts: Arc<dyn AlertDispatcher>,
}

impl Collaborators {
    /// In-memory storage with alerts written to the log.
    pub fn in_memory(extractor: Arc<dyn Extractor>, loader: Arc<dyn Loader>) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        Self {
            pipelines: repository.clone(),
            jobs: repository,
            extractor,
            loader,
            alerts: Arc::new(LoggingAlertDispatcher),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts = alerts;
        self
    }
}

struct InFlight {
    job_id: Uuid,
    cancel: CancellationToken,
}

type FlightMap = StdMutex<HashMap<Uuid, InFlight>>;

/// Clears the pipeline's in-flight slot when the run ends, however it ends.
struct FlightGuard<'a> {
    flights: &'a FlightMap,
    pipeline_id: Uuid,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pipeline_id);
    }
}

/// How a finished attempt affects the stored pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Succeeded,
    /// No counter change, only reschedule.
    Untouched,
}

pub struct PipelineRegistry {
    config: EngineConfig,
    pipelines: Arc<dyn PipelineRepository>,
    jobs: Arc<dyn JobRepository>,
    alerts: Arc<dyn AlertDispatcher>,
    executor: JobExecutor,
    scheduler: Scheduler,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    in_flight: FlightMap,
    /// Caller-supplied source data kept for the retries of a job, keyed by job id.
    retry_payloads: StdMutex<HashMap<Uuid, (Uuid, Vec<Record>)>>,
}

impl PipelineRegistry {
    pub fn new(config: EngineConfig, deps: Collaborators) -> Arc<Self> {
        Arc::new_cyclic(|registry: &Weak<Self>| {
            let target: Weak<dyn TimerTarget> = registry.clone();
            let executor = JobExecutor::new(
                deps.extractor,
                deps.loader,
                deps.jobs.clone(),
                config.default_quality_threshold,
                config.max_batch_size,
            );
            Self {
                pipelines: deps.pipelines,
                jobs: deps.jobs,
                alerts: deps.alerts,
                executor,
                scheduler: Scheduler::new(target),
                locks: Mutex::new(HashMap::new()),
                in_flight: StdMutex::new(HashMap::new()),
                retry_payloads: StdMutex::new(HashMap::new()),
                config,
            }
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Lifecycle ---

    /// Validate and store a new pipeline, arming its schedule when it starts active.
    pub async fn create(&self, config: PipelineConfig, auto_activate: bool) -> Result<Pipeline> {
        validate_pipeline_config(&config)?;
        let status = if auto_activate {
            PipelineStatus::Active
        } else {
            PipelineStatus::Draft
        };
        let mut pipeline = Pipeline::new(config, status);

        let lock = self.lock_for(pipeline.id).await;
        let _guard = lock.lock().await;
        self.plan_schedule(&mut pipeline, Utc::now())?;
        self.pipelines.save_pipeline(&pipeline).await?;
        self.apply_timer(&pipeline).await;

        info!(
            pipeline_id = %pipeline.id,
            name = %pipeline.config.name,
            status = %pipeline.status,
            "Pipeline created"
        );
        Ok(pipeline)
    }

    /// Merge `patch` into the stored config. The schedule is recomputed only
    /// when it changed.
    pub async fn update(&self, id: Uuid, patch: PipelineConfigPatch) -> Result<Pipeline> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut pipeline = self.require(id).await?;

        let merged = patch.apply(&pipeline.config);
        validate_pipeline_config(&merged)?;
        let schedule_changed = merged.schedule != pipeline.config.schedule;
        pipeline.config = merged;
        pipeline.updated_at = Utc::now();

        if schedule_changed {
            self.plan_schedule(&mut pipeline, Utc::now())?;
        }
        self.pipelines.save_pipeline(&pipeline).await?;
        if schedule_changed {
            self.apply_timer(&pipeline).await;
        }

        info!(pipeline_id = %id, schedule_changed, "Pipeline updated");
        Ok(pipeline)
    }

    /// draft | paused -> active
    pub async fn activate(&self, id: Uuid) -> Result<Pipeline> {
        self.transition(id, PipelineStatus::Active).await
    }

    /// active -> paused
    pub async fn pause(&self, id: Uuid) -> Result<Pipeline> {
        self.transition(id, PipelineStatus::Paused).await
    }

    /// active | paused -> draft
    pub async fn deactivate(&self, id: Uuid) -> Result<Pipeline> {
        self.transition(id, PipelineStatus::Draft).await
    }

    async fn transition(&self, id: Uuid, next: PipelineStatus) -> Result<Pipeline> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut pipeline = self.require(id).await?;

        if !pipeline.status.can_transition_to(next) {
            return Err(PipelineError::InvalidStateTransition {
                from: pipeline.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        let previous = pipeline.status;
        pipeline.status = next;
        pipeline.updated_at = Utc::now();
        self.plan_schedule(&mut pipeline, Utc::now())?;
        self.pipelines.save_pipeline(&pipeline).await?;

        if next == PipelineStatus::Active {
            self.apply_timer(&pipeline).await;
        } else {
            let armed = self.scheduler.armed(id).await;
            self.scheduler.cancel(id).await;
            if let Some((TimerKind::Retry { job_id }, _)) = armed {
                self.abandon_retry(job_id, format!("Pending retry dropped, pipeline is {next}"))
                    .await;
            }
        }

        info!(pipeline_id = %id, from = %previous, to = %next, "Pipeline status changed");
        Ok(pipeline)
    }

    /// Remove a pipeline and its job history. Any running job is cancelled.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        {
            let _guard = lock.lock().await;
            self.require(id).await?;

            self.scheduler.cancel(id).await;
            if let Some(flight) = self.flights().get(&id) {
                flight.cancel.cancel();
            }
            self.payloads().retain(|_, (pipeline_id, _)| *pipeline_id != id);

            self.pipelines.delete_pipeline(id).await?;
            let removed_jobs = self.jobs.delete_jobs(id).await?;
            info!(pipeline_id = %id, removed_jobs, "Pipeline deleted");
        }
        self.locks.lock().await.remove(&id);
        Ok(())
    }

    // --- Queries ---

    pub async fn get(&self, id: Uuid) -> Result<Pipeline> {
        self.require(id).await
    }

    pub async fn list(&self) -> Result<Vec<Pipeline>> {
        Ok(self.pipelines.list_pipelines().await?)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<PipelineJob> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound { id: job_id }.into())
    }

    /// Job history for a pipeline, oldest first.
    pub async fn list_jobs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineJob>> {
        self.require(pipeline_id).await?;
        Ok(self.jobs.list_jobs(pipeline_id).await?)
    }

    /// The timer currently armed for a pipeline, if any.
    pub async fn armed_timer(&self, id: Uuid) -> Option<(TimerKind, DateTime<Utc>)> {
        self.scheduler.armed(id).await
    }

    /// Id of the job currently running for a pipeline.
    pub fn in_flight_job(&self, id: Uuid) -> Option<Uuid> {
        self.flights().get(&id).map(|flight| flight.job_id)
    }

    // --- Execution ---

    /// Run the pipeline once. Job failures are reported in the result; an
    /// `Err` means the run could not start.
    pub async fn execute(&self, id: Uuid, options: ExecuteOptions) -> Result<PipelineResult> {
        self.start_job(id, options, None).await
    }

    async fn start_job(
        &self,
        id: Uuid,
        options: ExecuteOptions,
        fired_for: Option<DateTime<Utc>>,
    ) -> Result<PipelineResult> {
        let pipeline = self.require(id).await?;
        if !pipeline.status.is_runnable() {
            return Err(PipelineError::NotRunnable {
                id,
                status: pipeline.status.to_string(),
            }
            .into());
        }

        let mut job = PipelineJob::new(id, options.triggered_by, options.dry_run);
        let (_flight, cancel) = self.begin_flight(id, job.id)?;
        job.start();
        job.log(
            LogLevel::Info,
            format!(
                "Job started by {} trigger{}",
                job.triggered_by,
                if job.dry_run { " (dry run)" } else { "" }
            ),
        );
        info!(
            pipeline_id = %id,
            job_id = %job.id,
            triggered_by = %job.triggered_by,
            dry_run = job.dry_run,
            "Job started"
        );

        self.run_attempt(pipeline, job, options.source_data, cancel, fired_for)
            .await
    }

    /// Cancel a running or retrying job.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<PipelineJob> {
        let mut job = self.get_job(job_id).await?;

        let running = self
            .flights()
            .get(&job.pipeline_id)
            .filter(|flight| flight.job_id == job_id)
            .map(|flight| flight.cancel.clone());
        if let Some(cancel) = running {
            cancel.cancel();
            info!(pipeline_id = %job.pipeline_id, %job_id, "Cancellation requested");
            return Ok(job);
        }

        match job.status {
            JobStatus::Retrying | JobStatus::Pending | JobStatus::Running => {
                if let Some((TimerKind::Retry { job_id: armed }, _)) =
                    self.scheduler.armed(job.pipeline_id).await
                {
                    if armed == job_id {
                        self.scheduler.cancel(job.pipeline_id).await;
                    }
                }
                self.payloads().remove(&job_id);
                job.cancel();
                job.log(LogLevel::Warn, "Job cancelled");
                self.jobs.save_job(&job).await?;
                self.settle(job.pipeline_id, Settlement::Untouched, None).await?;
                info!(pipeline_id = %job.pipeline_id, %job_id, "Job cancelled");
                Ok(job)
            }
            status => Err(PipelineError::InvalidStateTransition {
                from: status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            }
            .into()),
        }
    }

    /// Re-arm timers for everything found in the repositories, typically at start-up.
    ///
    /// Active scheduled pipelines get a fresh next run, retrying jobs get their
    /// retry timer back, and jobs left running by a previous process are marked
    /// failed. Returns how many timers were armed.
    pub async fn restore(&self) -> Result<usize> {
        let mut armed = 0;
        for pipeline in self.pipelines.list_pipelines().await? {
            let id = pipeline.id;
            let retry = self.retry_config(&pipeline);
            let mut pending_retry = None;

            for mut job in self.jobs.list_jobs(id).await? {
                match job.status {
                    JobStatus::Running | JobStatus::Pending => {
                        job.fail();
                        job.log(LogLevel::Error, "Job interrupted by engine restart");
                        self.jobs.save_job(&job).await?;
                        warn!(pipeline_id = %id, job_id = %job.id, "Marked interrupted job failed");
                    }
                    JobStatus::Retrying if pipeline.status.is_runnable() => {
                        pending_retry = Some(job);
                    }
                    JobStatus::Retrying => {
                        let reason =
                            format!("Pending retry dropped, pipeline is {}", pipeline.status);
                        self.abandon_retry(job.id, reason).await;
                    }
                    _ => {}
                }
            }

            if let Some(job) = pending_retry {
                let delay = retry
                    .as_ref()
                    .map(|cfg| next_delay(cfg, job.retry_count.saturating_sub(1)))
                    .unwrap_or(Duration::ZERO);
                self.scheduler
                    .arm(id, delay, TimerKind::Retry { job_id: job.id })
                    .await;
                armed += 1;
            } else if pipeline.armed_schedule().is_some()
                && self.settle(id, Settlement::Untouched, None).await?.is_some()
            {
                armed += 1;
            }
        }
        info!(armed, "Registry restored");
        Ok(armed)
    }

    /// Cancel every timer and running job.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        for flight in self.flights().values() {
            flight.cancel.cancel();
        }
        info!("Registry shut down");
    }

    // --- Internals ---

    async fn run_attempt(
        &self,
        pipeline: Pipeline,
        mut job: PipelineJob,
        source_data: Option<Vec<Record>>,
        cancel: CancellationToken,
        fired_for: Option<DateTime<Utc>>,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let id = pipeline.id;
        let retry = self.retry_config(&pipeline);
        let kept_source = match (&retry, &source_data) {
            (Some(_), Some(records)) if !job.dry_run => Some(records.clone()),
            _ => None,
        };

        let run = self
            .executor
            .run(&pipeline, &mut job, source_data, &cancel)
            .await;

        let mut errors = Vec::new();
        let mut next_retry_at = None;
        match run.outcome {
            Ok(()) => {
                self.settle(id, Settlement::Succeeded, fired_for).await?;
            }
            Err(JobError::Cancelled) => {
                errors.push(RunError {
                    phase: JobError::Cancelled.phase().to_string(),
                    message: JobError::Cancelled.to_string(),
                    recoverable: false,
                });
                self.settle(id, Settlement::Untouched, fired_for).await?;
            }
            Err(e) => {
                let mut recoverable = false;
                let mut exhausted = None;
                self.settle_failure(id).await?;
                match &retry {
                    // Dry runs are counted but never retried or alerted on.
                    _ if job.dry_run => {
                        self.settle(id, Settlement::Untouched, fired_for).await?;
                    }
                    Some(cfg) if should_retry(&job, cfg) => {
                        job.mark_retrying();
                        let delay = next_delay(cfg, job.retry_count - 1);
                        job.log(
                            LogLevel::Warn,
                            format!(
                                "Retry {}/{} scheduled in {}ms",
                                job.retry_count,
                                cfg.max_attempts,
                                delay.as_millis()
                            ),
                        );
                        info!(
                            pipeline_id = %id,
                            job_id = %job.id,
                            attempt = job.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "Retry scheduled"
                        );
                        // The timer may fire at once; it must find the job retrying.
                        self.jobs.save_job(&job).await?;
                        next_retry_at =
                            Some(self.schedule_retry(id, job.id, delay, kept_source).await);
                        recoverable = true;
                    }
                    _ => {
                        exhausted = retry.as_ref().map(|_| JobError::RetryExhausted {
                            attempts: job.retry_count + 1,
                        });
                        if let Some(exhausted) = &exhausted {
                            job.log(LogLevel::Error, exhausted.to_string());
                        }
                        self.send_alert(&pipeline, &job, &e);
                        self.settle(id, Settlement::Untouched, fired_for).await?;
                    }
                }
                errors.push(RunError {
                    phase: e.phase().to_string(),
                    message: e.to_string(),
                    recoverable,
                });
                if let Some(exhausted) = exhausted {
                    errors.push(RunError {
                        phase: exhausted.phase().to_string(),
                        message: exhausted.to_string(),
                        recoverable: false,
                    });
                }
            }
        }

        // A pipeline deleted mid-run takes its job history with it.
        if self.pipelines.get_pipeline(id).await?.is_some() {
            self.jobs.save_job(&job).await?;
        }

        Ok(PipelineResult {
            job_id: job.id,
            pipeline_id: id,
            status: job.status,
            dry_run: job.dry_run,
            records_processed: job.records_processed,
            records_loaded: job.records_loaded,
            records_failed: job.records_failed,
            quality: run.quality,
            errors,
            next_retry_at,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn retry_job(&self, pipeline_id: Uuid, job_id: Uuid) -> Result<()> {
        let Some(mut job) = self.jobs.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Retrying {
            return Ok(());
        }
        let Some(pipeline) = self.pipelines.get_pipeline(pipeline_id).await? else {
            return Ok(());
        };
        if !pipeline.status.is_runnable() {
            let reason = format!("Pending retry dropped, pipeline is {}", pipeline.status);
            self.abandon_retry(job_id, reason).await;
            return Ok(());
        }

        let (_flight, cancel) = match self.begin_flight(pipeline_id, job_id) {
            Ok(flight) => flight,
            Err(_) => {
                let delay = self
                    .retry_config(&pipeline)
                    .map(|cfg| next_delay(&cfg, job.retry_count.saturating_sub(1)))
                    .unwrap_or(Duration::from_secs(1));
                info!(
                    %pipeline_id,
                    %job_id,
                    delay_ms = delay.as_millis() as u64,
                    "Another job is running, retry re-armed"
                );
                self.scheduler
                    .arm(pipeline_id, delay, TimerKind::Retry { job_id })
                    .await;
                return Ok(());
            }
        };

        job.resume();
        job.log(
            LogLevel::Info,
            format!("Retry attempt {} started", job.retry_count),
        );
        let payload = self.payloads().remove(&job_id).map(|(_, records)| records);
        let result = self.run_attempt(pipeline, job, payload, cancel, None).await?;
        info!(
            %pipeline_id,
            %job_id,
            status = %result.status,
            "Retry attempt finished"
        );
        Ok(())
    }

    async fn run_scheduled(&self, pipeline_id: Uuid) -> Result<()> {
        let Some(pipeline) = self.pipelines.get_pipeline(pipeline_id).await? else {
            return Ok(());
        };
        let Some(schedule) = pipeline.armed_schedule() else {
            return Ok(());
        };
        if schedule.frequency == Frequency::Once {
            self.consume_once(pipeline_id).await?;
        }
        let fired_for = pipeline.next_run_at;

        let options = ExecuteOptions::default().triggered_by(TriggeredBy::Schedule);
        match self.start_job(pipeline_id, options, fired_for).await {
            Ok(result) => {
                info!(
                    %pipeline_id,
                    job_id = %result.job_id,
                    status = %result.status,
                    "Scheduled run finished"
                );
                Ok(())
            }
            Err(EngineError::Pipeline(PipelineError::JobInFlight { .. })) => {
                info!(%pipeline_id, "Job already in flight, scheduled run skipped");
                self.settle(pipeline_id, Settlement::Untouched, fired_for).await?;
                Ok(())
            }
            Err(e) => {
                self.settle(pipeline_id, Settlement::Untouched, fired_for).await?;
                Err(e)
            }
        }
    }

    /// A `once` schedule is spent as soon as it fires.
    async fn consume_once(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let Some(mut pipeline) = self.pipelines.get_pipeline(id).await? else {
            return Ok(());
        };
        if let Some(schedule) = pipeline.config.schedule.as_mut() {
            schedule.enabled = false;
        }
        pipeline.next_run_at = None;
        pipeline.updated_at = Utc::now();
        self.pipelines.save_pipeline(&pipeline).await?;
        Ok(())
    }

    /// Apply a finished run to the stored pipeline and roll its schedule forward.
    ///
    /// `fired_for` is the slot a scheduled run was started for; the next run is
    /// computed from no earlier than that instant.
    async fn settle(
        &self,
        id: Uuid,
        settlement: Settlement,
        fired_for: Option<DateTime<Utc>>,
    ) -> Result<Option<Pipeline>> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let Some(mut pipeline) = self.pipelines.get_pipeline(id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        match settlement {
            Settlement::Succeeded => pipeline.record_success(now),
            Settlement::Untouched => {}
        }
        let base = fired_for.map_or(now, |slot| slot.max(now));
        if let Err(e) = self.plan_schedule(&mut pipeline, base) {
            warn!(pipeline_id = %id, error = %e, "Could not compute next run");
            pipeline.next_run_at = None;
        }
        self.pipelines.save_pipeline(&pipeline).await?;
        self.apply_timer(&pipeline).await;
        Ok(Some(pipeline))
    }

    /// Count a failed run without touching the timer; the retry decision comes next.
    async fn settle_failure(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if let Some(mut pipeline) = self.pipelines.get_pipeline(id).await? {
            pipeline.record_failure(Utc::now());
            self.pipelines.save_pipeline(&pipeline).await?;
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        pipeline_id: Uuid,
        job_id: Uuid,
        delay: Duration,
        payload: Option<Vec<Record>>,
    ) -> DateTime<Utc> {
        // One timer per pipeline: an older pending retry is abandoned.
        if let Some((TimerKind::Retry { job_id: older }, _)) =
            self.scheduler.armed(pipeline_id).await
        {
            if older != job_id {
                self.abandon_retry(older, format!("Pending retry superseded by job {job_id}"))
                    .await;
            }
        }
        if let Some(records) = payload {
            self.payloads().insert(job_id, (pipeline_id, records));
        }
        self.scheduler
            .arm(pipeline_id, delay, TimerKind::Retry { job_id })
            .await
    }

    /// Settle a retrying job whose timer will never fire: it ends `failed`
    /// and its kept source data is released.
    async fn abandon_retry(&self, job_id: Uuid, reason: String) {
        self.payloads().remove(&job_id);
        match self.jobs.get_job(job_id).await {
            Ok(Some(mut job)) if job.status == JobStatus::Retrying => {
                job.fail();
                job.log(LogLevel::Warn, reason.as_str());
                info!(pipeline_id = %job.pipeline_id, %job_id, %reason, "Retry abandoned");
                if let Err(e) = self.jobs.save_job(&job).await {
                    warn!(%job_id, error = %e, "Failed to save abandoned job");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%job_id, error = %e, "Failed to load abandoned job"),
        }
    }

    fn send_alert(&self, pipeline: &Pipeline, job: &PipelineJob, error: &JobError) {
        let Some(alert) = pipeline.config.alert.as_ref() else {
            return;
        };
        if !alert.on_failure || alert.channels.is_empty() {
            return;
        }
        let event = AlertEvent {
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.config.name.clone(),
            job_id: job.id,
            phase: error.phase().to_string(),
            message: error.to_string(),
            attempts: job.retry_count + 1,
            occurred_at: Utc::now(),
        };
        info!(
            pipeline_id = %pipeline.id,
            job_id = %job.id,
            channels = alert.channels.len(),
            "Dispatching failure alert"
        );
        dispatch_all(Arc::clone(&self.alerts), alert.channels.clone(), event);
    }

    fn plan_schedule(
        &self,
        pipeline: &mut Pipeline,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SchedulerError> {
        pipeline.next_run_at = match pipeline.armed_schedule() {
            Some(schedule) => Some(calculate_next_run(
                schedule,
                now,
                self.config.default_timezone.as_deref(),
            )?),
            None => None,
        };
        Ok(())
    }

    /// Make the armed timer agree with `next_run_at`. A pending retry keeps
    /// the slot; the schedule is re-armed once the retry settles.
    async fn apply_timer(&self, pipeline: &Pipeline) {
        let armed = self.scheduler.armed(pipeline.id).await;
        if matches!(armed, Some((TimerKind::Retry { .. }, _))) {
            return;
        }
        match pipeline.next_run_at {
            Some(at) => {
                self.scheduler
                    .arm_at(pipeline.id, at, TimerKind::Schedule)
                    .await;
            }
            None => {
                if armed.is_some() {
                    self.scheduler.cancel(pipeline.id).await;
                }
            }
        }
    }

    fn retry_config(&self, pipeline: &Pipeline) -> Option<RetryConfig> {
        pipeline
            .config
            .retry
            .clone()
            .or_else(|| self.config.default_retry.clone())
    }

    fn begin_flight(
        &self,
        pipeline_id: Uuid,
        job_id: Uuid,
    ) -> std::result::Result<(FlightGuard<'_>, CancellationToken), PipelineError> {
        let mut flights = self.flights();
        if flights.contains_key(&pipeline_id) {
            return Err(PipelineError::JobInFlight { id: pipeline_id });
        }
        let cancel = CancellationToken::new();
        flights.insert(
            pipeline_id,
            InFlight {
                job_id,
                cancel: cancel.clone(),
            },
        );
        Ok((
            FlightGuard {
                flights: &self.in_flight,
                pipeline_id,
            },
            cancel,
        ))
    }

    fn flights(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn payloads(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, (Uuid, Vec<Record>)>> {
        self.retry_payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn require(&self, id: Uuid) -> Result<Pipeline> {
        self.pipelines
            .get_pipeline(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound { id }.into())
    }
}

#[async_trait]
impl TimerTarget for PipelineRegistry {
    async fn on_timer(&self, pipeline_id: Uuid, kind: TimerKind) {
        let outcome = match kind {
            TimerKind::Schedule => self.run_scheduled(pipeline_id).await,
            TimerKind::Retry { job_id } => self.retry_job(pipeline_id, job_id).await,
        };
        if let Err(e) = outcome {
            error!(%pipeline_id, ?kind, error = %e, "Timer-triggered run failed to start");
        }
    }
}
