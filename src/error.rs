use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures while admitting a webhook delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// The provider re-sent a delivery we already accepted. Acknowledged
    /// with a 200 no-op so the provider stops retrying.
    #[error("duplicate delivery")]
    DuplicateDelivery,
}

impl WebhookError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WebhookError::InvalidPayload(_) | WebhookError::UnsupportedEventType(_)
        )
    }
}

/// Shared-store failures. Callers on the quota path treat these as a signal
/// to fail open; everything else surfaces them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored value corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Outbound delivery failures to a chat destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Timeout, connection error, 408/429/5xx. The buffered events are kept
    /// so a later pass can retry.
    #[error("retryable delivery failure: {0}")]
    Retryable(String),

    /// Rejected configuration (bad webhook URL, revoked token). Retrying
    /// cannot help.
    #[error("terminal delivery failure: {0}")]
    Terminal(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

/// JSON error body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
