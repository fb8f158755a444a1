//! YAML/JSON parser and validator for pipeline definitions.

use crate::error::{ConfigError, EngineError};
use crate::pipeline::types::{EndpointDescriptor, Frequency, PipelineConfig};
use crate::scheduler::{CronExpression, resolve_timezone};
use crate::transform::TransformationChain;
use std::collections::HashSet;

/// Parse a pipeline definition. Documents starting with `{` are read as JSON,
/// everything else as YAML.
pub fn parse_pipeline_config(input: &str) -> Result<PipelineConfig, ConfigError> {
    if input.trim_start().starts_with('{') {
        serde_json::from_str(input).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    } else {
        serde_yaml::from_str(input).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Validate a pipeline definition before it is stored.
///
/// Checks:
/// - name, source and destination are present
/// - step ids are non-empty and unique
/// - filter expressions parse and validation patterns compile
/// - cron expressions and timezone names are valid
/// - retry, alert and quality settings are consistent
pub fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), EngineError> {
    if config.name.trim().is_empty() {
        return Err(missing("name"));
    }
    validate_endpoint("source", config.source.as_ref())?;
    validate_endpoint("destination", config.destination.as_ref())?;

    let mut seen_ids = HashSet::new();
    for step in &config.transformations {
        if step.id.trim().is_empty() {
            return Err(invalid(format!(
                "Transformation step '{}' has an empty id",
                step.name
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(invalid(format!("Duplicate step ID: '{}'", step.id)));
        }
    }
    TransformationChain::new(&config.transformations)?;

    if let Some(schedule) = &config.schedule {
        if schedule.frequency == Frequency::Cron {
            let expression = schedule
                .cron_expression
                .as_deref()
                .ok_or(crate::error::SchedulerError::MissingCronExpression)?;
            CronExpression::parse(expression)?;
        }
        if let Some(tz) = &schedule.timezone {
            resolve_timezone(Some(tz))?;
        }
    }

    if let Some(retry) = &config.retry {
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(invalid(format!(
                "Retry backoff multiplier must be at least 1, got {}",
                retry.backoff_multiplier
            )));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid(format!(
                "Retry max delay {}ms is below the initial delay {}ms",
                retry.max_delay_ms, retry.initial_delay_ms
            )));
        }
    }

    if let Some(alert) = &config.alert {
        if let Some(channel) = alert.channels.iter().find(|c| c.target.trim().is_empty()) {
            return Err(invalid(format!(
                "Alert channel of type {} has an empty target",
                channel.channel_type
            )));
        }
    }

    if let Some(threshold) = config.quality_threshold {
        if !(0.0..=100.0).contains(&threshold) {
            return Err(invalid(format!(
                "Quality threshold must be between 0 and 100, got {threshold}"
            )));
        }
    }

    Ok(())
}

fn validate_endpoint(
    field: &str,
    endpoint: Option<&EndpointDescriptor>,
) -> Result<(), EngineError> {
    match endpoint {
        None => Err(missing(field)),
        Some(e) if e.kind.trim().is_empty() => Err(missing(&format!("{field}.kind"))),
        Some(_) => Ok(()),
    }
}

fn missing(field: &str) -> EngineError {
    ConfigError::MissingField {
        field: field.to_string(),
    }
    .into()
}

fn invalid(message: String) -> EngineError {
    ConfigError::Invalid { message }.into()
}
