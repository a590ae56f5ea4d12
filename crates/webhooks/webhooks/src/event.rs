//! Events and the envelope they are delivered in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::webhook::Webhook;

/// Event type used for synthetic test deliveries.
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// A discrete occurrence in the host system that may trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier; also half of the delivery idempotency key.
    pub id: String,
    /// Event type (e.g. `order.updated`).
    pub event_type: String,
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Opaque event payload.
    pub payload: Value,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new event with a random identifier.
    pub fn new(event_type: impl Into<String>, tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builds the wire envelope for a regular delivery.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            tenant_id: self.tenant_id.clone(),
            created_at: self.created_at,
            data: self.payload.clone(),
            is_test: false,
        }
    }
}

/// JSON body POSTed to receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event identifier.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tenant identifier.
    pub tenant_id: String,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
    /// Event payload.
    pub data: Value,
    /// Whether this is a synthetic diagnostic delivery.
    pub is_test: bool,
}

impl EventEnvelope {
    /// Synthesizes a diagnostic envelope addressed to one webhook.
    pub fn test_for(webhook: &Webhook) -> Self {
        let now = Utc::now();
        Self {
            id: format!("test_{}", uuid::Uuid::new_v4()),
            event_type: TEST_EVENT_TYPE.to_string(),
            tenant_id: webhook.tenant_id.clone(),
            created_at: now,
            data: serde_json::json!({
                "webhook_id": webhook.id,
                "message": "This is a test delivery",
                "sent_at": now.to_rfc3339(),
            }),
            is_test: true,
        }
    }

    /// Serializes the envelope to the exact bytes that get signed and sent.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
