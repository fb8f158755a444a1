//! Error types for the Pipewright engine core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering configuration, job execution, transformations, scheduling,
//! pipeline lifecycle and persistence.

use uuid::Uuid;

/// Top-level error type for the Pipewright core library.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from pipeline configuration. Always fatal for the create/update call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors raised while a job runs. All but `Cancelled` count as job failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("Extraction failed: {message}")]
    Extraction { message: String },

    #[error("Transformation failed: {message}")]
    Transformation { message: String },

    #[error("Load failed: {message}")]
    Load { message: String },

    #[error("Quality score {score} is below the threshold of {threshold}")]
    QualityThreshold { score: f64, threshold: f64 },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Retry attempts exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

impl JobError {
    /// Short name of the phase that produced the error.
    pub fn phase(&self) -> &'static str {
        match self {
            JobError::Extraction { .. } => "extract",
            JobError::Transformation { .. } => "transform",
            JobError::Load { .. } => "load",
            JobError::QualityThreshold { .. } => "gate",
            JobError::Cancelled => "cancel",
            JobError::RetryExhausted { .. } => "retry",
        }
    }
}

/// Errors in transformation step configuration, detected before any record is touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("Invalid filter expression '{expression}' at offset {position}: {message}")]
    InvalidExpression {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors from schedule computation and timer management.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Cron frequency requires a cron expression")]
    MissingCronExpression,

    #[error("Unknown timezone: {name}")]
    InvalidTimezone { name: String },

    #[error("No upcoming run found for '{expression}'")]
    NoUpcomingRun { expression: String },
}

/// Errors from pipeline lifecycle operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline not found: {id}")]
    NotFound { id: Uuid },

    #[error("Job not found: {id}")]
    JobNotFound { id: Uuid },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Pipeline {id} cannot run while {status}")]
    NotRunnable { id: Uuid, status: String },

    #[error("Pipeline {id} already has a job in flight")]
    JobInFlight { id: Uuid },
}

/// Errors surfaced by a repository implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryError {
    #[error("Repository unavailable: {message}")]
    Unavailable { message: String },

    #[error("Repository write failed: {message}")]
    WriteFailed { message: String },
}

/// Errors from alert delivery. Never propagated past the dispatcher call site.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertError {
    #[error("Alert delivery to {target} failed: {message}")]
    DeliveryFailed { target: String, message: String },
}

/// A type alias for results using the top-level `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = EngineError::Config(ConfigError::MissingField {
            field: "source".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required field: source"
        );
    }

    #[test]
    fn test_error_display_job() {
        let err = EngineError::Job(JobError::QualityThreshold {
            score: 42.0,
            threshold: 80.0,
        });
        assert_eq!(
            err.to_string(),
            "Job error: Quality score 42 is below the threshold of 80"
        );
    }

    #[test]
    fn test_error_display_pipeline() {
        let id = Uuid::nil();
        let err = EngineError::Pipeline(PipelineError::InvalidStateTransition {
            from: "draft".into(),
            to: "paused".into(),
        });
        assert_eq!(
            err.to_string(),
            "Pipeline error: Invalid state transition: draft -> paused"
        );

        let err = PipelineError::JobInFlight { id };
        assert!(err.to_string().contains("already has a job in flight"));
    }

    #[test]
    fn test_error_display_scheduler() {
        let err = SchedulerError::InvalidCronExpression {
            expression: "61 * * * *".into(),
            message: "minute out of range".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid cron expression '61 * * * *': minute out of range"
        );
    }

    #[test]
    fn test_job_error_phase() {
        assert_eq!(
            JobError::Extraction {
                message: "timeout".into()
            }
            .phase(),
            "extract"
        );
        assert_eq!(
            JobError::Load {
                message: "refused".into()
            }
            .phase(),
            "load"
        );
        assert_eq!(
            JobError::QualityThreshold {
                score: 1.0,
                threshold: 2.0
            }
            .phase(),
            "gate"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: EngineError = serde_err.into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
