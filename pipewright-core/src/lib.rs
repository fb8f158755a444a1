//! # Pipewright Core
//!
//! Core library for the Pipewright ETL engine.
//! Provides the pipeline registry, scheduler, transformation chain, data
//! quality gate, job executor with retries, configuration, and logging setup.

pub mod alerts;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod quality;
pub mod scheduler;
pub mod transform;

// Re-export commonly used types at the crate root.
pub use alerts::{AlertDispatcher, AlertEvent, LoggingAlertDispatcher};
pub use config::{EngineConfig, LoggingConfig, load_config};
pub use error::{
    AlertError, ConfigError, EngineError, JobError, PipelineError, RepositoryError, Result,
    SchedulerError, TransformError,
};
pub use job::{
    ExecuteOptions, Extractor, JobStatus, Loader, PipelineJob, PipelineResult, TriggeredBy,
};
pub use pipeline::{
    AlertChannel, AlertConfig, ChannelType, Collaborators, EndpointDescriptor, Frequency,
    InMemoryRepository, JobRepository, Pipeline, PipelineConfig, PipelineConfigPatch,
    PipelineRegistry, PipelineRepository, PipelineStatus, RetryConfig, ScheduleConfig,
    parse_pipeline_config, validate_pipeline_config,
};
pub use quality::{QualityReport, QualityValidator};
pub use scheduler::{CronExpression, calculate_next_run};
pub use transform::{Record, StepOperation, TransformationChain, TransformationStep};
