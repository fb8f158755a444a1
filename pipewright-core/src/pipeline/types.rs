//! Pipeline definition types.

use crate::transform::TransformationStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where records come from or go to. Interpreted only by the injected
/// extractor and loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl EndpointDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// How often a scheduled pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Once,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Once => write!(f, "once"),
            Frequency::Hourly => write!(f, "hourly"),
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::Cron => write!(f, "cron"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// When a pipeline runs on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// IANA zone name used for calendar boundaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ScheduleConfig {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            enabled: true,
            frequency,
            cron_expression: None,
            start_time: None,
            timezone: None,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron_expression: Some(expression.into()),
            ..Self::new(Frequency::Cron)
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }
}

/// Exponential backoff settings for failed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Slack,
    Webhook,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Email => write!(f, "email"),
            ChannelType::Slack => write!(f, "slack"),
            ChannelType::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertChannel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub target: String,
}

impl AlertChannel {
    pub fn new(channel_type: ChannelType, target: impl Into<String>) -> Self {
        Self {
            channel_type,
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default)]
    pub channels: Vec<AlertChannel>,
}

/// The user-supplied definition of a pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointDescriptor>,
    #[serde(default)]
    pub transformations: Vec<TransformationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertConfig>,
    /// Minimum overall quality score a batch needs before it is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
}

impl PipelineConfig {
    pub fn new(
        name: impl Into<String>,
        source: EndpointDescriptor,
        destination: EndpointDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            source: Some(source),
            destination: Some(destination),
            ..Self::default()
        }
    }

    pub fn with_step(mut self, step: TransformationStep) -> Self {
        self.transformations.push(step);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_alert(mut self, alert: AlertConfig) -> Self {
        self.alert = Some(alert);
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// The schedule, if present and enabled.
    pub fn active_schedule(&self) -> Option<&ScheduleConfig> {
        self.schedule.as_ref().filter(|s| s.enabled)
    }
}

/// A partial update. Present fields replace the stored ones.
///
/// Optional sections take `Some(None)` (JSON `null`) to clear the stored value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformations: Option<Vec<TransformationStep>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub schedule: Option<Option<ScheduleConfig>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry: Option<Option<RetryConfig>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub alert: Option<Option<AlertConfig>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub quality_threshold: Option<Option<f64>>,
}

/// A field that appears in the input, `null` included, is `Some`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl PipelineConfigPatch {
    /// Merge this patch over `base`, returning the new config.
    pub fn apply(self, base: &PipelineConfig) -> PipelineConfig {
        let mut merged = base.clone();
        if let Some(name) = self.name {
            merged.name = name;
        }
        if let Some(source) = self.source {
            merged.source = Some(source);
        }
        if let Some(destination) = self.destination {
            merged.destination = Some(destination);
        }
        if let Some(steps) = self.transformations {
            merged.transformations = steps;
        }
        if let Some(description) = self.description {
            merged.description = description;
        }
        if let Some(schedule) = self.schedule {
            merged.schedule = schedule;
        }
        if let Some(retry) = self.retry {
            merged.retry = retry;
        }
        if let Some(alert) = self.alert {
            merged.alert = alert;
        }
        if let Some(threshold) = self.quality_threshold {
            merged.quality_threshold = threshold;
        }
        merged
    }
}

/// Lifecycle state. Deletion removes the pipeline rather than marking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Draft,
    Active,
    Paused,
}

impl PipelineStatus {
    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        matches!(
            (self, next),
            (PipelineStatus::Draft, PipelineStatus::Active)
                | (PipelineStatus::Paused, PipelineStatus::Active)
                | (PipelineStatus::Active, PipelineStatus::Paused)
                | (PipelineStatus::Active, PipelineStatus::Draft)
                | (PipelineStatus::Paused, PipelineStatus::Draft)
        )
    }

    /// Manual and scheduled runs are only allowed in these states.
    pub fn is_runnable(self) -> bool {
        matches!(self, PipelineStatus::Draft | PipelineStatus::Active)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Draft => write!(f, "draft"),
            PipelineStatus::Active => write!(f, "active"),
            PipelineStatus::Paused => write!(f, "paused"),
        }
    }
}

/// A registered pipeline with its run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub config: PipelineConfig,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub successful_runs: u64,
    #[serde(default)]
    pub failed_runs: u64,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, status: PipelineStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config,
            status,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
        }
    }

    /// The schedule that should currently have a timer armed, if any.
    pub fn armed_schedule(&self) -> Option<&ScheduleConfig> {
        if self.status == PipelineStatus::Active {
            self.config.active_schedule()
        } else {
            None
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.successful_runs += 1;
        self.last_run_at = Some(at);
        self.updated_at = at;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.failed_runs += 1;
        self.last_run_at = Some(at);
        self.updated_at = at;
    }

    /// Effective quality gate for this pipeline.
    pub fn quality_threshold(&self, default: f64) -> f64 {
        self.config.quality_threshold.unwrap_or(default)
    }
}
