use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeliveryError;
use crate::notify::RichNotification;

pub mod slack;
pub mod telegram;

pub use slack::SlackDestination;
pub use telegram::TelegramDestination;

pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Per-tenant destination configuration, loaded from the tenant registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationConfig {
    Slack {
        webhook_url: String,
    },
    Telegram {
        bot_token: String,
        chat_id: String,
    },
}

impl DestinationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationConfig::Slack { .. } => "slack",
            DestinationConfig::Telegram { .. } => "telegram",
        }
    }
}

/// One chat sink. Implementations render the notification into their own
/// wire format and deliver it over HTTP.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, config: &DestinationConfig) -> bool;

    async fn deliver(
        &self,
        config: &DestinationConfig,
        notification: &RichNotification,
    ) -> Result<(), DeliveryError>;
}

/// Fans a notification out to every configured destination. Terminal
/// failures are logged and swallowed (retrying cannot fix a revoked token);
/// the first retryable failure is propagated so the caller keeps the buffer.
pub struct Dispatcher {
    destinations: Vec<Arc<dyn Destination>>,
}

impl Dispatcher {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self { destinations }
    }

    /// Default production set: Slack and Telegram over a shared client.
    pub fn standard() -> Self {
        let client = shared_client();
        Self::new(vec![
            Arc::new(SlackDestination::new(client.clone())),
            Arc::new(TelegramDestination::new(client)),
        ])
    }

    pub async fn deliver_all(
        &self,
        configs: &[DestinationConfig],
        notification: &RichNotification,
        metrics: &crate::metrics::Metrics,
    ) -> Result<usize, DeliveryError> {
        let mut delivered = 0;
        let mut first_retryable: Option<DeliveryError> = None;

        for config in configs {
            let Some(destination) = self.destinations.iter().find(|d| d.accepts(config)) else {
                tracing::warn!(kind = config.kind(), "no destination registered for config");
                continue;
            };
            let result = destination.deliver(config, notification).await;
            let result_label = match &result {
                Ok(()) => "ok",
                Err(e) if e.is_retryable() => "retryable",
                Err(_) => "terminal",
            };
            metrics
                .notifications_delivered_total
                .with_label_values(&[destination.name(), result_label])
                .inc();
            match result {
                Ok(()) => delivered += 1,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        destination = destination.name(),
                        error = %e,
                        "delivery failed, will retry"
                    );
                    if first_retryable.is_none() {
                        first_retryable = Some(e);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        destination = destination.name(),
                        error = %e,
                        "delivery rejected, dropping"
                    );
                }
            }
        }

        match first_retryable {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }
}

pub(crate) fn shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

/// Maps a response status to a delivery error. Timeouts and server-side
/// trouble are retryable; a rejected request is not.
pub(crate) fn classify_status(name: &str, status: reqwest::StatusCode) -> DeliveryError {
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        DeliveryError::Retryable(format!("{name} returned {status}"))
    } else {
        DeliveryError::Terminal(format!("{name} returned {status}"))
    }
}

pub(crate) fn classify_request_error(name: &str, error: reqwest::Error) -> DeliveryError {
    DeliveryError::Retryable(format!("{name} request failed: {error}"))
}
