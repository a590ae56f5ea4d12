//! Webhook error types.

use thiserror::Error;

use crate::attempt::AttemptState;

/// Result type for webhook operations.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Error type for webhook operations.
///
/// Delivery failures (timeouts, non-2xx responses, refused connections) are
/// not errors at this level: they are recorded on the attempt as an
/// [`ErrorClass`](crate::ErrorClass). These variants cover everything else.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The webhook cannot be delivered to as configured (empty URL, empty secret).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid signature.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature expired.
    #[error("Signature expired")]
    ExpiredSignature,

    /// Invalid payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Attempted a state transition the attempt state machine does not allow.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the attempt was in.
        from: AttemptState,
        /// State that was requested.
        to: AttemptState,
    },

    /// Webhook not found.
    #[error("Webhook not found: {0}")]
    WebhookNotFound(String),

    /// Registry lookup failed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout.
    #[error("Request timeout")]
    Timeout,

    /// The dispatcher is shutting down and no longer accepts work.
    #[error("Dispatcher is shut down")]
    Shutdown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebhookError::Timeout
        } else {
            WebhookError::Http(err.to_string())
        }
    }
}
