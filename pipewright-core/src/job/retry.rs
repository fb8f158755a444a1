//! Retry policy: whether a failed job gets another attempt, and how long to wait.

use crate::job::types::PipelineJob;
use crate::pipeline::RetryConfig;
use std::time::Duration;

/// Whether `job` may be attempted again under `config`.
pub fn should_retry(job: &PipelineJob, config: &RetryConfig) -> bool {
    job.retry_count < config.max_attempts
}

/// Backoff before retry number `attempt` (zero-based), capped at `max_delay_ms`.
pub fn next_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = base.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}
