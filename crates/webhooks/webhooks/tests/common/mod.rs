//! Common test utilities for hookrelay_webhooks integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hookrelay_webhooks::{
    AttemptFilter, DeliveryAttempt, DeliveryStore, Dispatcher, DispatcherConfig,
    InMemoryDeliveryStore, InMemoryWebhookRegistry, Webhook,
};

pub const TENANT: &str = "t1";
pub const SECRET: &str = "s3cr3t";

/// Dispatcher with millisecond backoff so retry scenarios finish quickly.
pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig::new()
        .max_in_flight(8)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(200))
        .jitter(false)
        .poll_interval_ms(5)
        .request_timeout(Duration::from_secs(2))
        .test_event_timeout(Duration::from_secs(5))
}

/// Webhook subscribed to every `order.*` event.
pub fn order_webhook(id: &str, url: &str) -> Webhook {
    Webhook::new(TENANT, url, SECRET)
        .with_id(id)
        .events(["order.*"])
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<InMemoryWebhookRegistry>,
    pub store: Arc<InMemoryDeliveryStore>,
}

impl Harness {
    /// Latest snapshot of every attempt for an event, in creation order.
    pub async fn attempts(&self, event_id: &str) -> Vec<DeliveryAttempt> {
        self.store
            .query(&AttemptFilter::new().event(event_id))
            .await
            .unwrap()
    }

    pub async fn settle(&self) {
        assert!(
            self.dispatcher.wait_idle(Duration::from_secs(10)).await,
            "deliveries did not settle"
        );
    }
}

/// Starts an HTTP dispatcher over in-memory registry and store.
pub async fn start(config: DispatcherConfig, webhooks: Vec<Webhook>) -> Harness {
    let registry = Arc::new(InMemoryWebhookRegistry::with_webhooks(webhooks));
    let store = Arc::new(InMemoryDeliveryStore::new());
    let dispatcher = Arc::new(
        Dispatcher::with_http(config, registry.clone(), store.clone())
            .expect("http transport"),
    );
    dispatcher.start().await.unwrap();

    Harness {
        dispatcher,
        registry,
        store,
    }
}
