//! # Hookrelay Webhooks
//!
//! Outbound webhook delivery for multi-tenant systems:
//! - Fan-out of events to subscribed webhooks, at most one delivery per (webhook, event)
//! - HMAC-SHA256 signed requests with timestamp replay protection
//! - Retries with jittered exponential backoff and a bounded budget
//! - Bounded worker pool with optional per-webhook concurrency caps
//! - Append-only attempt log and per-webhook delivery summaries
//!
//! ## Example
//!
//! ```rust,ignore
//! use hookrelay_webhooks::{
//!     Dispatcher, DispatcherConfig, Event, InMemoryDeliveryStore, InMemoryWebhookRegistry, Webhook,
//! };
//!
//! let registry = Arc::new(InMemoryWebhookRegistry::with_webhooks([
//!     Webhook::new("tenant-1", "https://example.com/webhook", "secret123").events(["order.*"]),
//! ]));
//! let dispatcher = Dispatcher::with_http(
//!     DispatcherConfig::default(),
//!     registry,
//!     Arc::new(InMemoryDeliveryStore::new()),
//! )?;
//! dispatcher.start().await?;
//!
//! dispatcher
//!     .dispatch(&Event::new("order.updated", "tenant-1", json!({ "order_id": 42 })))
//!     .await?;
//! ```

mod attempt;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod event;
mod pool;
mod queue;
mod receiver;
mod registry;
mod retry;
mod signature;
mod store;
mod summary;
mod transport;
mod webhook;

pub use attempt::{AttemptState, DeliveryAttempt, ErrorCategory, ErrorClass};
pub use config::DispatcherConfig;
pub use delivery::{
    ATTEMPT_HEADER, DELIVERY_ID_HEADER, DeliveryEngine, EVENT_ID_HEADER, EVENT_TYPE_HEADER,
};
pub use dispatcher::Dispatcher;
pub use error::{WebhookError, WebhookResult};
pub use event::{Event, EventEnvelope, TEST_EVENT_TYPE};
pub use pool::WorkerPool;
pub use queue::{DeliveryJob, DeliveryQueue};
pub use receiver::{DEFAULT_TOLERANCE_SECS, WebhookReceiver};
pub use registry::{InMemoryWebhookRegistry, WebhookRegistry};
pub use retry::{AbandonReason, ExponentialBackoff, RetryDecision, RetryScheduler, RetryStrategy};
pub use signature::{SIGNATURE_HEADER, SignatureError, SignatureVersion, WebhookSigner, sign};
pub use store::{AttemptFilter, AttemptLog, DeliveryStore, InMemoryDeliveryStore};
pub use summary::{DeliverySummaryAggregator, FailureInfo, WebhookSummary};
#[cfg(feature = "http-client")]
pub use transport::HttpTransport;
pub use transport::{
    DeliveryTransport, MAX_RESPONSE_BODY_CHARS, OutboundRequest, TransportError, TransportResponse,
};
pub use webhook::{Webhook, WebhookMetadata};
