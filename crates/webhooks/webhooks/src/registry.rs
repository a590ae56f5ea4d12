//! Webhook registry abstraction.
//!
//! Registration records are owned elsewhere; the dispatcher only reads them.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{WebhookError, WebhookResult};
use crate::webhook::Webhook;

/// Read access to registered webhooks.
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    /// Lists active webhooks of a tenant subscribed to an event type.
    async fn list_active(&self, tenant_id: &str, event_type: &str) -> WebhookResult<Vec<Webhook>>;

    /// Gets a webhook by ID, active or not.
    async fn get(&self, webhook_id: &str) -> WebhookResult<Option<Webhook>>;

    /// Lists every webhook of a tenant, or of all tenants when `None`.
    async fn list(&self, tenant_id: Option<&str>) -> WebhookResult<Vec<Webhook>>;
}

/// In-memory registry, mainly for tests and the standalone binary.
#[derive(Default)]
pub struct InMemoryWebhookRegistry {
    webhooks: RwLock<HashMap<String, Webhook>>,
}

impl InMemoryWebhookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry seeded with webhooks.
    pub fn with_webhooks(webhooks: impl IntoIterator<Item = Webhook>) -> Self {
        let map = webhooks.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            webhooks: RwLock::new(map),
        }
    }

    /// Registers or replaces a webhook.
    pub async fn register(&self, webhook: Webhook) {
        let mut webhooks = self.webhooks.write().await;
        webhooks.insert(webhook.id.clone(), webhook);
    }

    /// Removes a webhook.
    pub async fn remove(&self, webhook_id: &str) -> Option<Webhook> {
        let mut webhooks = self.webhooks.write().await;
        webhooks.remove(webhook_id)
    }

    /// Sets the active flag of a webhook.
    pub async fn set_active(&self, webhook_id: &str, active: bool) -> WebhookResult<()> {
        let mut webhooks = self.webhooks.write().await;
        let webhook = webhooks
            .get_mut(webhook_id)
            .ok_or_else(|| WebhookError::WebhookNotFound(webhook_id.to_string()))?;
        webhook.active = active;
        Ok(())
    }
}

#[async_trait]
impl WebhookRegistry for InMemoryWebhookRegistry {
    async fn list_active(&self, tenant_id: &str, event_type: &str) -> WebhookResult<Vec<Webhook>> {
        let webhooks = self.webhooks.read().await;
        let mut matching: Vec<Webhook> = webhooks
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.should_receive(event_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    async fn get(&self, webhook_id: &str) -> WebhookResult<Option<Webhook>> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks.get(webhook_id).cloned())
    }

    async fn list(&self, tenant_id: Option<&str>) -> WebhookResult<Vec<Webhook>> {
        let webhooks = self.webhooks.read().await;
        let mut listed: Vec<Webhook> = webhooks
            .values()
            .filter(|w| tenant_id.is_none_or(|t| w.tenant_id == t))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }
}
