//! Job execution: the per-run job record, the phase executor, and the retry policy.

pub mod executor;
pub mod retry;
pub mod types;

pub use executor::{Extractor, JobExecutor, JobRun, Loader};
pub use retry::{next_delay, should_retry};
pub use types::{
    ExecuteOptions, JobLogEntry, JobStatus, LogLevel, PipelineJob, PipelineResult, RunError,
    TriggeredBy,
};
