//! Webhook registration snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{WebhookError, WebhookResult};

/// A tenant-registered HTTP endpoint subscribed to one or more event types.
///
/// The dispatcher only ever sees immutable snapshots of this type; changes
/// made in the registry apply from the next dispatch onwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Unique identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Target URL.
    pub url: String,
    /// Secret for signing payloads.
    pub secret: String,
    /// Subscribed event types. Entries may be exact (`order.updated`),
    /// namespace wildcards (`order.*`) or `*`.
    #[serde(default)]
    pub event_types: BTreeSet<String>,
    /// Whether this webhook receives new deliveries.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Webhook metadata.
    #[serde(default)]
    pub metadata: WebhookMetadata,
}

fn default_active() -> bool {
    true
}

impl std::fmt::Debug for Webhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("event_types", &self.event_types)
            .field("active", &self.active)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Webhook {
    /// Creates a new active webhook with a random identifier.
    pub fn new(
        tenant_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            url: url.into(),
            secret: secret.into(),
            event_types: BTreeSet::new(),
            active: true,
            metadata: WebhookMetadata::default(),
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Subscribes to the given event types or patterns.
    pub fn events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types.extend(events.into_iter().map(Into::into));
        self
    }

    /// Subscribes to all events.
    pub fn all_events(mut self) -> Self {
        self.event_types.insert("*".to_string());
        self
    }

    /// Sets the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.metadata.description = Some(desc.into());
        self
    }

    /// Adds a custom header sent with every delivery.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.headers.insert(key.into(), value.into());
        self
    }

    /// Overrides the request timeout in milliseconds.
    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.metadata.timeout_ms = Some(timeout);
        self
    }

    /// Caps concurrent deliveries to this webhook. A cap of 1 gives strict ordering.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.metadata.max_concurrency = Some(max.max(1));
        self
    }

    /// Marks the webhook inactive.
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Checks whether this webhook is subscribed to an event type, ignoring the active flag.
    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|pattern| pattern_matches(pattern, event_type))
    }

    /// Checks if this webhook should receive a new delivery of an event type.
    pub fn should_receive(&self, event_type: &str) -> bool {
        self.active && self.is_subscribed(event_type)
    }

    /// Checks that the webhook can be delivered to at all.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Configuration`] for an empty or non-HTTP URL
    /// or an empty secret.
    pub fn validate(&self) -> WebhookResult<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(WebhookError::Configuration(format!(
                "webhook {} has an empty URL",
                self.id
            )));
        }

        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        if rest.is_none_or(|host| host.is_empty()) {
            return Err(WebhookError::Configuration(format!(
                "webhook {} has a non-HTTP URL: {}",
                self.id, url
            )));
        }

        if self.secret.trim().is_empty() {
            return Err(WebhookError::Configuration(format!(
                "webhook {} has an empty secret",
                self.id
            )));
        }

        Ok(())
    }
}

/// Matches an event type against a subscription entry.
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == event_type,
    }
}

/// Metadata associated with a webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookMetadata {
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Custom headers to include in requests.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request timeout in milliseconds; the dispatcher default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Maximum concurrent in-flight deliveries; unbounded when unset.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}
