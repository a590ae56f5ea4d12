//! # Hookrelay Server
//!
//! Standalone relay that runs the webhook dispatcher from a TOML
//! configuration, with an optional JSON-lines journal so deliveries survive
//! restarts.

mod config;
mod journal;

pub use config::{AppConfig, ConfigError, LogFormat, ServerConfig, load_config, parse_config};
pub use journal::JournalStore;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing_subscriber::EnvFilter;

use hookrelay_webhooks::{
    DeliveryAttempt, DeliveryStore, Dispatcher, Event, InMemoryDeliveryStore,
    InMemoryWebhookRegistry, WebhookError, WebhookSummary,
};

/// Relay error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }
}

/// An event as written in dispatch input, one JSON object per line.
///
/// Only `type` and `tenant_id` are required.
#[derive(Debug, Clone, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", alias = "event_type")]
    pub event_type: String,
    pub tenant_id: String,
    #[serde(default, alias = "payload")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl EventInput {
    /// Converts into an [`Event`], generating missing fields.
    pub fn into_event(self) -> Event {
        let mut event = Event::new(self.event_type, self.tenant_id, self.data);
        if let Some(id) = self.id {
            event = event.with_id(id);
        }
        if let Some(created_at) = self.created_at {
            event.created_at = created_at;
        }
        event
    }
}

/// Outcome of [`Relay::dispatch_lines`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchReport {
    /// Events read.
    pub events: usize,
    /// Deliveries created.
    pub deliveries: usize,
    /// Lines that could not be parsed or dispatched.
    pub rejected: usize,
}

/// Dispatcher wired from an [`AppConfig`].
pub struct Relay {
    config: AppConfig,
    dispatcher: Dispatcher,
}

impl Relay {
    /// Builds the registry, store and dispatcher described by the configuration.
    pub async fn new(config: AppConfig) -> Result<Self, ServerError> {
        let registry = Arc::new(InMemoryWebhookRegistry::with_webhooks(
            config.webhooks.iter().cloned(),
        ));
        let store: Arc<dyn DeliveryStore> = match &config.server.journal_path {
            Some(path) => Arc::new(JournalStore::open(path).await?),
            None => Arc::new(InMemoryDeliveryStore::new()),
        };
        let dispatcher = Dispatcher::with_http(config.delivery.clone(), registry, store)?;

        tracing::info!(
            webhooks = config.webhooks.len(),
            journal = ?config.server.journal_path,
            "Relay configured"
        );
        Ok(Self { config, dispatcher })
    }

    /// Starts the workers, resuming unfinished deliveries.
    pub async fn start(&self) -> Result<usize, ServerError> {
        Ok(self.dispatcher.start().await?)
    }

    /// Starts the workers without resuming unfinished deliveries.
    pub async fn start_workers(&self) -> Result<(), ServerError> {
        Ok(self.dispatcher.start_workers().await?)
    }

    /// Dispatches every event read from `reader`.
    ///
    /// Blank lines are ignored; unreadable lines are logged and counted as rejected.
    pub async fn dispatch_lines<R>(&self, reader: R) -> Result<DispatchReport, ServerError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = DispatchReport::default();
        let mut lines = reader.lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let event = match serde_json::from_str::<EventInput>(&line) {
                Ok(input) => input.into_event(),
                Err(e) => {
                    tracing::warn!(line = line_no, error = %e, "Skipping unreadable event");
                    report.rejected += 1;
                    continue;
                }
            };

            report.events += 1;
            match self.dispatcher.dispatch(&event).await {
                Ok(created) => report.deliveries += created.len(),
                Err(WebhookError::InvalidPayload(reason)) => {
                    tracing::warn!(line = line_no, event_id = %event.id, %reason, "Rejected event");
                    report.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Sends a test event to one webhook.
    pub async fn send_test(&self, webhook_id: &str) -> Result<DeliveryAttempt, ServerError> {
        Ok(self.dispatcher.send_test_event(webhook_id).await?)
    }

    /// Delivery summaries.
    pub async fn summary(&self, tenant_id: Option<&str>) -> Result<Vec<WebhookSummary>, ServerError> {
        Ok(self.dispatcher.summary(tenant_id).await?)
    }

    /// Drops journal records older than `days`.
    pub async fn prune(&self, days: u32) -> Result<usize, ServerError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        Ok(self.dispatcher.store().prune(cutoff).await?)
    }

    /// Waits for queued deliveries, then stops the workers.
    ///
    /// Returns `false` if deliveries were still pending when `wait` ran out.
    pub async fn drain(&self, wait: Duration) -> bool {
        let idle = self.dispatcher.wait_idle(wait).await;
        self.dispatcher.shutdown().await;
        idle
    }

    /// Gets the configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Gets the dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
