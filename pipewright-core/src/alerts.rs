//! Failure alerts. Delivery is delegated to an injected dispatcher; this module
//! only fans events out to every configured channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AlertError;
use crate::pipeline::AlertChannel;

/// A job that failed for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    pub job_id: Uuid,
    pub phase: String,
    pub message: String,
    /// Total attempts made, including the first.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Delivers an alert to one channel.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify(&self, channel: &AlertChannel, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Writes alerts to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlertDispatcher;

#[async_trait]
impl AlertDispatcher for LoggingAlertDispatcher {
    async fn notify(&self, channel: &AlertChannel, event: &AlertEvent) -> Result<(), AlertError> {
        warn!(
            channel = %channel.channel_type,
            target = %channel.target,
            pipeline_id = %event.pipeline_id,
            job_id = %event.job_id,
            attempts = event.attempts,
            "Pipeline '{}' failed: {}",
            event.pipeline_name,
            event.message
        );
        Ok(())
    }
}

/// Notify every channel concurrently on a background task. Delivery failures
/// are logged and never reach the caller.
pub fn dispatch_all(
    dispatcher: Arc<dyn AlertDispatcher>,
    channels: Vec<AlertChannel>,
    event: AlertEvent,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let deliveries = channels.iter().map(|channel| {
            let dispatcher = Arc::clone(&dispatcher);
            let event = &event;
            async move { (channel, dispatcher.notify(channel, event).await) }
        });
        for (channel, result) in futures::future::join_all(deliveries).await {
            match result {
                Ok(()) => info!(
                    channel = %channel.channel_type,
                    target = %channel.target,
                    job_id = %event.job_id,
                    "Alert delivered"
                ),
                Err(e) => warn!(
                    channel = %channel.channel_type,
                    target = %channel.target,
                    job_id = %event.job_id,
                    error = %e,
                    "Alert delivery failed"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ChannelType;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertDispatcher for RecordingDispatcher {
        async fn notify(
            &self,
            channel: &AlertChannel,
            _event: &AlertEvent,
        ) -> Result<(), AlertError> {
            if channel.channel_type == ChannelType::Webhook {
                return Err(AlertError::DeliveryFailed {
                    target: channel.target.clone(),
                    message: "502".into(),
                });
            }
            self.delivered.lock().await.push(channel.target.clone());
            Ok(())
        }
    }

    fn event() -> AlertEvent {
        AlertEvent {
            pipeline_id: Uuid::new_v4(),
            pipeline_name: "orders".into(),
            job_id: Uuid::new_v4(),
            phase: "extract".into(),
            message: "connection refused".into(),
            attempts: 4,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_survives_failed_channel() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let channels = vec![
            AlertChannel::new(ChannelType::Email, "oncall@example.com"),
            AlertChannel::new(ChannelType::Webhook, "https://hooks.example.com/x"),
            AlertChannel::new(ChannelType::Slack, "#data"),
        ];
        dispatch_all(dispatcher.clone(), channels, event())
            .await
            .unwrap();
        let mut delivered = dispatcher.delivered.lock().await.clone();
        delivered.sort();
        assert_eq!(delivered, vec!["#data", "oncall@example.com"]);
    }

    #[tokio::test]
    async fn test_logging_dispatcher_succeeds() {
        let channel = AlertChannel::new(ChannelType::Slack, "#data");
        assert!(LoggingAlertDispatcher.notify(&channel, &event()).await.is_ok());
    }
}
