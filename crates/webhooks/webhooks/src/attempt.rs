//! Delivery attempt records and their state machine.
//!
//! ```text
//! Pending ──► InFlight ──► Succeeded
//!    │            │
//!    └────────────┴──► Failed ──► Abandoned
//!                        │
//!                        └──► (new Pending record, attempt_number + 1)
//! ```
//!
//! `Pending → Failed` only happens for configuration failures, which never
//! reach the network. A `Failed` record is never moved back to `Pending`;
//! retrying creates the next record instead, so the store keeps a full
//! audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WebhookError, WebhookResult};
use crate::event::EventEnvelope;
use crate::webhook::Webhook;

/// Lifecycle state of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Waiting for its scheduled time or for a free worker.
    Pending,
    /// HTTP request in progress.
    InFlight,
    /// Receiver acknowledged with a 2xx.
    Succeeded,
    /// This try failed; a retry may follow as a new record.
    Failed,
    /// Failed and no further attempts will be made.
    Abandoned,
}

impl AttemptState {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Abandoned)
    }

    /// Whether the HTTP try (if any) is over.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::Failed | AttemptState::Abandoned
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttemptState::Pending => "pending",
            AttemptState::InFlight => "in_flight",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
            AttemptState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Webhook URL or secret unusable; never retried.
    Configuration,
    /// No response within the request timeout.
    Timeout,
    /// The receiver refused or could not accept the connection.
    ConnectionRefused,
    /// Any other transport-level failure.
    Network,
    /// 5xx response.
    ServerError,
    /// 429 response.
    RateLimited,
    /// 4xx response other than 429.
    Rejected,
    /// 1xx or 3xx response.
    UnexpectedStatus,
    /// The process stopped while the request was in flight.
    Interrupted,
}

/// Coarse failure taxonomy used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad webhook configuration; abandoned immediately.
    Configuration,
    /// Receiver down or unreachable; retried.
    TransientNetwork,
    /// Receiver answered and refused the delivery; retried but reported separately.
    PermanentRejection,
}

impl ErrorClass {
    /// Classifies a non-2xx HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorClass::RateLimited,
            400..=499 => ErrorClass::Rejected,
            500..=599 => ErrorClass::ServerError,
            _ => ErrorClass::UnexpectedStatus,
        }
    }

    /// Maps the class onto the failure taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorClass::Configuration => ErrorCategory::Configuration,
            ErrorClass::Rejected => ErrorCategory::PermanentRejection,
            ErrorClass::Timeout
            | ErrorClass::ConnectionRefused
            | ErrorClass::Network
            | ErrorClass::ServerError
            | ErrorClass::RateLimited
            | ErrorClass::UnexpectedStatus
            | ErrorClass::Interrupted => ErrorCategory::TransientNetwork,
        }
    }

    /// Whether another attempt may be scheduled after this failure.
    pub fn is_retryable(&self) -> bool {
        self.category() != ErrorCategory::Configuration
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused => "connection_refused",
            ErrorClass::Network => "network",
            ErrorClass::ServerError => "server_error",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Rejected => "rejected",
            ErrorClass::UnexpectedStatus => "unexpected_status",
            ErrorClass::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// One HTTP try to deliver a specific event to a specific webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Attempt identifier.
    pub id: String,
    /// Target webhook.
    pub webhook_id: String,
    /// Tenant owning the webhook.
    pub tenant_id: String,
    /// Delivered event.
    pub event_id: String,
    /// Delivered event type.
    pub event_type: String,
    /// 1-based, gapless per (webhook, event).
    pub attempt_number: u32,
    /// Current state.
    pub state: AttemptState,
    /// Earliest time a worker may pick this attempt up.
    pub scheduled_at: DateTime<Utc>,
    /// When the attempt went in flight.
    pub started_at: Option<DateTime<Utc>>,
    /// When the try finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// HTTP status, if a response was received.
    pub status_code: Option<u16>,
    /// Failure classification.
    pub error_class: Option<ErrorClass>,
    /// Human-readable failure detail.
    pub error_message: Option<String>,
    /// Time from request start to response or failure.
    pub latency_ms: Option<u64>,
    /// Diagnostic delivery created by a test send.
    pub is_test: bool,
    /// Envelope delivered by this attempt, kept so retries can resume after a restart.
    pub envelope: EventEnvelope,
}

impl DeliveryAttempt {
    /// Creates the first attempt for a (webhook, envelope) pair.
    pub fn first(webhook: &Webhook, envelope: EventEnvelope, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_id: webhook.id.clone(),
            tenant_id: webhook.tenant_id.clone(),
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            attempt_number: 1,
            state: AttemptState::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status_code: None,
            error_class: None,
            error_message: None,
            latency_ms: None,
            is_test: envelope.is_test,
            envelope,
        }
    }

    /// Idempotency key of the delivery this attempt belongs to.
    pub fn delivery_key(&self) -> (String, String) {
        (self.webhook_id.clone(), self.event_id.clone())
    }

    /// `Pending → InFlight`.
    pub fn start(&mut self, now: DateTime<Utc>) -> WebhookResult<()> {
        self.transition(AttemptState::InFlight)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// `InFlight → Succeeded`.
    pub fn succeed(&mut self, status_code: u16, latency_ms: u64, now: DateTime<Utc>) -> WebhookResult<()> {
        self.transition(AttemptState::Succeeded)?;
        self.status_code = Some(status_code);
        self.latency_ms = Some(latency_ms);
        self.completed_at = Some(now);
        Ok(())
    }

    /// `InFlight → Failed`, or `Pending → Failed` for configuration failures.
    pub fn fail(
        &mut self,
        class: ErrorClass,
        status_code: Option<u16>,
        message: impl Into<String>,
        latency_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let allowed = match self.state {
            AttemptState::InFlight => true,
            AttemptState::Pending => class == ErrorClass::Configuration,
            _ => false,
        };
        if !allowed {
            return Err(WebhookError::InvalidTransition {
                from: self.state,
                to: AttemptState::Failed,
            });
        }

        self.state = AttemptState::Failed;
        self.error_class = Some(class);
        self.status_code = status_code;
        self.error_message = Some(message.into());
        self.latency_ms = latency_ms;
        self.completed_at = Some(now);
        Ok(())
    }

    /// `Failed → Abandoned`. Keeps the failure details and completion time.
    pub fn abandon(&mut self) -> WebhookResult<()> {
        self.transition(AttemptState::Abandoned)
    }

    /// Creates the next `Pending` record for this delivery.
    pub fn next_attempt(&self, scheduled_at: DateTime<Utc>) -> WebhookResult<DeliveryAttempt> {
        if self.state != AttemptState::Failed {
            return Err(WebhookError::InvalidTransition {
                from: self.state,
                to: AttemptState::Pending,
            });
        }

        Ok(DeliveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_id: self.webhook_id.clone(),
            tenant_id: self.tenant_id.clone(),
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            attempt_number: self.attempt_number + 1,
            state: AttemptState::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status_code: None,
            error_class: None,
            error_message: None,
            latency_ms: None,
            is_test: self.is_test,
            envelope: self.envelope.clone(),
        })
    }

    fn transition(&mut self, to: AttemptState) -> WebhookResult<()> {
        let allowed = matches!(
            (self.state, to),
            (AttemptState::Pending, AttemptState::InFlight)
                | (AttemptState::InFlight, AttemptState::Succeeded)
                | (AttemptState::Failed, AttemptState::Abandoned)
        );
        if !allowed {
            return Err(WebhookError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
