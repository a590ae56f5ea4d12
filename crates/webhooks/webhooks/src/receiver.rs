//! Webhook receiver for verifying incoming webhooks.

use crate::error::{WebhookError, WebhookResult};
use crate::event::EventEnvelope;
use crate::signature::WebhookSigner;

/// Default tolerance between the signed timestamp and the receiver's clock.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies signed deliveries on the receiving side.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    signer: WebhookSigner,
    /// Tolerance for timestamp validation (in seconds).
    tolerance_secs: i64,
}

impl WebhookReceiver {
    /// Creates a new webhook receiver.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Configuration`] if the secret is blank.
    pub fn new(secret: &str) -> WebhookResult<Self> {
        Ok(Self {
            signer: WebhookSigner::new(secret)?,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        })
    }

    /// Sets the timestamp tolerance.
    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verifies a webhook signature and parses the envelope.
    pub fn verify(&self, signature: &str, payload: &[u8]) -> WebhookResult<EventEnvelope> {
        self.verify_signature(signature, payload)?;
        serde_json::from_slice(payload).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }

    /// Verifies only the signature without parsing.
    pub fn verify_signature(&self, signature: &str, payload: &[u8]) -> WebhookResult<()> {
        self.verify_signature_at(signature, payload, chrono::Utc::now().timestamp())
    }

    /// Verifies the signature against an explicit clock reading.
    pub fn verify_signature_at(&self, signature: &str, payload: &[u8], now: i64) -> WebhookResult<()> {
        self.signer
            .verify_header(signature, payload, now, self.tolerance_secs)
            .map_err(WebhookError::from)
    }
}
