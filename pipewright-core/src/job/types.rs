//! Job records, logs and run results.

use crate::quality::QualityReport;
use crate::transform::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status of a pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    /// Completed and cancelled jobs never run again. Failed jobs may still be retried.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// What started a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    #[default]
    Manual,
    Schedule,
    Retry,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::Manual => write!(f, "manual"),
            TriggeredBy::Schedule => write!(f, "schedule"),
            TriggeredBy::Retry => write!(f, "retry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of a job's structured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// One invocation of a pipeline, reused across its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: JobStatus,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: usize,
    pub records_failed: usize,
    pub records_loaded: usize,
    /// Percent complete, 0..=100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub retry_count: u32,
    #[serde(default)]
    pub logs: Vec<JobLogEntry>,
}

impl PipelineJob {
    /// Create a new pending job.
    pub fn new(pipeline_id: Uuid, triggered_by: TriggeredBy, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            status: JobStatus::Pending,
            triggered_by,
            dry_run,
            started_at: Utc::now(),
            completed_at: None,
            records_processed: 0,
            records_failed: 0,
            records_loaded: 0,
            progress: 0,
            current_step: None,
            retry_count: 0,
            logs: Vec::new(),
        }
    }

    /// Mark the job as running and reset per-attempt counters.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Utc::now();
        self.completed_at = None;
        self.records_processed = 0;
        self.records_failed = 0;
        self.records_loaded = 0;
        self.progress = 0;
        self.current_step = None;
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.current_step = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Move a failed job into the retry queue.
    pub fn mark_retrying(&mut self) {
        self.status = JobStatus::Retrying;
        self.retry_count += 1;
    }

    /// Start the next attempt of a retrying job.
    pub fn resume(&mut self) {
        self.triggered_by = TriggeredBy::Retry;
        self.start();
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let step = self.current_step.clone();
        self.logs.push(JobLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step,
        });
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

/// Options for a single `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Records to use instead of calling the extractor.
    pub source_data: Option<Vec<Record>>,
    /// Run every phase but skip the load and leave counters untouched.
    pub dry_run: bool,
    pub triggered_by: TriggeredBy,
}

impl ExecuteOptions {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn with_source_data(mut self, records: Vec<Record>) -> Self {
        self.source_data = Some(records);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn triggered_by(mut self, trigger: TriggeredBy) -> Self {
        self.triggered_by = trigger;
        self
    }
}

/// A failure recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub phase: String,
    pub message: String,
    /// Set when a retry was scheduled for this failure.
    pub recoverable: bool,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub job_id: Uuid,
    pub pipeline_id: Uuid,
    pub status: JobStatus,
    pub dry_run: bool,
    pub records_processed: usize,
    pub records_loaded: usize,
    pub records_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = PipelineJob::new(Uuid::new_v4(), TriggeredBy::Manual, false);
        assert_eq!(job.status, JobStatus::Pending);
        job.start();
        assert!(job.is_running());
        job.records_processed = 10;
        job.fail();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.status.is_terminal());

        job.mark_retrying();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);

        job.resume();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.triggered_by, TriggeredBy::Retry);
        assert_eq!(job.records_processed, 0);
        assert_eq!(job.retry_count, 1);

        job.complete();
        assert_eq!(job.progress, 100);
        assert!(job.status.is_terminal());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_log_carries_current_step() {
        let mut job = PipelineJob::new(Uuid::new_v4(), TriggeredBy::Schedule, false);
        job.current_step = Some("extract".into());
        job.log(LogLevel::Info, "Extracted 3 records");
        assert_eq!(job.logs.len(), 1);
        assert_eq!(job.logs[0].step.as_deref(), Some("extract"));
        assert_eq!(job.logs[0].level, LogLevel::Info);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut job = PipelineJob::new(Uuid::new_v4(), TriggeredBy::Manual, false);
        job.set_progress(250);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_status_display_and_serde() {
        assert_eq!(JobStatus::Retrying.to_string(), "retrying");
        let json = serde_json::to_string(&TriggeredBy::Schedule).unwrap();
        assert_eq!(json, "\"schedule\"");
    }
}
