//! Built-in alert channels.

use std::sync::Arc;

use async_trait::async_trait;
use wmsync_types::alert::{Alert, Severity};

use super::{AlertChannel, LOG_CHANNEL};
use crate::config::{AlertConfig, ChannelConfig};
use crate::error::{AlertDeliveryError, ConfigurationError};

/// Writes alerts through `tracing` at a level derived from severity.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: LOG_CHANNEL.to_string(),
        }
    }

    /// Log synchronously. Also used as the dispatcher's fallback.
    pub fn write(alert: &Alert) {
        let correlation_id = alert.correlation_id.as_ref().map(|c| c.as_str());
        let context = serde_json::to_string(&alert.context).unwrap_or_default();
        match alert.severity {
            Severity::Info => tracing::info!(
                alert_type = %alert.kind,
                correlation_id,
                context = %context,
                "{}: {}",
                alert.title,
                alert.message
            ),
            Severity::Warning => tracing::warn!(
                alert_type = %alert.kind,
                correlation_id,
                context = %context,
                "{}: {}",
                alert.title,
                alert.message
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                alert_type = %alert.kind,
                severity = %alert.severity,
                correlation_id,
                context = %context,
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError> {
        Self::write(alert);
        Ok(())
    }
}

/// POSTs the alert JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        check_status(response.status())
    }
}

/// Posts a chat-style `{"text": ...}` payload.
#[derive(Debug, Clone)]
pub struct ChatWebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl ChatWebhookChannel {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    fn render(alert: &Alert) -> String {
        let mut text = format!(
            "[{}] {}\n{}",
            alert.severity.as_str().to_uppercase(),
            alert.title,
            alert.message
        );
        if let Some(correlation_id) = &alert.correlation_id {
            text.push_str(&format!("\ncorrelation: {correlation_id}"));
        }
        text
    }
}

#[async_trait]
impl AlertChannel for ChatWebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError> {
        let payload = serde_json::json!({ "text": Self::render(alert) });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        check_status(response.status())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), AlertDeliveryError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(AlertDeliveryError::Status {
            status: status.as_u16(),
        })
    }
}

/// Build the configured channels, always including [`LogChannel`].
///
/// # Errors
///
/// Returns [`ConfigurationError`] if the HTTP client cannot be built.
pub fn channels_from_config(
    config: &AlertConfig,
) -> Result<Vec<Arc<dyn AlertChannel>>, ConfigurationError> {
    let mut channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogChannel::new())];
    if config.channels.is_empty() {
        return Ok(channels);
    }

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .map_err(|e| ConfigurationError::single(format!("alert http client: {e}")))?;

    for channel in &config.channels {
        let built: Arc<dyn AlertChannel> = match channel {
            ChannelConfig::Webhook { name, url } => {
                Arc::new(WebhookChannel::new(name, url, client.clone()))
            }
            ChannelConfig::Chat { name, url } => {
                Arc::new(ChatWebhookChannel::new(name, url, client.clone()))
            }
        };
        channels.push(built);
    }
    Ok(channels)
}
