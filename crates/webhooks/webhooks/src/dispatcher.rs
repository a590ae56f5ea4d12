//! Dispatcher - main entry point.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

use crate::attempt::{AttemptState, DeliveryAttempt, ErrorClass};
use crate::config::DispatcherConfig;
use crate::delivery::DeliveryEngine;
use crate::error::{WebhookError, WebhookResult};
use crate::event::{Event, EventEnvelope};
use crate::pool::WorkerPool;
use crate::queue::{DeliveryJob, DeliveryQueue};
use crate::registry::WebhookRegistry;
use crate::retry::RetryScheduler;
use crate::store::{AttemptFilter, DeliveryStore};
use crate::summary::{DeliverySummaryAggregator, WebhookSummary};
use crate::transport::DeliveryTransport;
use crate::webhook::Webhook;

/// Fans events out to subscribed webhooks and drives their deliveries.
///
/// ```rust,ignore
/// use hookrelay_webhooks::{Dispatcher, DispatcherConfig, Event};
///
/// let dispatcher = Dispatcher::with_http(DispatcherConfig::default(), registry, store)?;
/// dispatcher.start().await?;
///
/// dispatcher
///     .dispatch(&Event::new("order.updated", "t1", json!({ "order_id": 42 })))
///     .await?;
/// ```
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn DeliveryStore>,
    queue: Arc<DeliveryQueue>,
    engine: Arc<DeliveryEngine>,
    aggregator: DeliverySummaryAggregator,
    /// (webhook, event) pairs currently being dispatched.
    claims: Mutex<HashSet<(String, String)>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl Dispatcher {
    /// Creates a dispatcher. Workers are not running until [`start`](Self::start).
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn DeliveryStore>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let queue = Arc::new(DeliveryQueue::new());
        let scheduler = RetryScheduler::new(Arc::new(config.backoff()));
        let engine = Arc::new(DeliveryEngine::new(
            transport,
            store.clone(),
            registry.clone(),
            queue.clone(),
            scheduler,
            config.clone(),
        ));
        let aggregator =
            DeliverySummaryAggregator::new(registry.clone(), store.clone(), config.summary_window());

        Self {
            config,
            registry,
            store,
            queue,
            engine,
            aggregator,
            claims: Mutex::new(HashSet::new()),
            pool: Mutex::new(None),
        }
    }

    /// Creates a dispatcher delivering over HTTP with `reqwest`.
    #[cfg(feature = "http-client")]
    pub fn with_http(
        config: DispatcherConfig,
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn DeliveryStore>,
    ) -> WebhookResult<Self> {
        let transport = crate::transport::HttpTransport::new(&config.user_agent)?;
        Ok(Self::new(config, registry, store, Arc::new(transport)))
    }

    /// Recovers unfinished deliveries and starts the worker pool.
    ///
    /// Returns the number of recovered attempts put back on the queue.
    pub async fn start(&self) -> WebhookResult<usize> {
        self.launch(true).await
    }

    /// Starts the worker pool without the recovery sweep.
    ///
    /// Unfinished deliveries in the store stay untouched until a later
    /// [`start`](Self::start) or [`resume_pending`](Self::resume_pending).
    pub async fn start_workers(&self) -> WebhookResult<()> {
        self.launch(false).await.map(|_| ())
    }

    async fn launch(&self, recover: bool) -> WebhookResult<usize> {
        if self.queue.is_closed().await {
            return Err(WebhookError::Shutdown);
        }

        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return Ok(0);
        }

        let resumed = if recover { self.recover().await? } else { 0 };
        *pool = Some(WorkerPool::spawn(
            self.engine.clone(),
            self.queue.clone(),
            self.config.worker_count(),
            self.config.poll_interval(),
        ));

        tracing::info!(
            resumed,
            recovered = recover,
            workers = self.config.worker_count(),
            "Dispatcher started"
        );
        Ok(resumed)
    }

    /// Stops accepting work and waits for in-flight deliveries.
    ///
    /// Queued attempts stay `Pending` in the store and resume on the next start.
    pub async fn shutdown(&self) {
        self.queue.close().await;
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        tracing::info!(queued = self.queue.len().await, "Dispatcher stopped");
    }

    /// Whether the worker pool is running.
    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Waits until nothing is queued or in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while !self.queue.is_idle().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Creates one `Pending` attempt per subscribed active webhook.
    ///
    /// Returns as soon as the attempts are recorded and queued; delivery
    /// happens in the background. An event already dispatched to a webhook
    /// is skipped for that webhook.
    ///
    /// # Errors
    ///
    /// Fails on registry or store errors, on an event without type or tenant,
    /// and after [`shutdown`](Self::shutdown).
    pub async fn dispatch(&self, event: &Event) -> WebhookResult<Vec<DeliveryAttempt>> {
        if event.event_type.is_empty() || event.tenant_id.is_empty() {
            return Err(WebhookError::InvalidPayload(
                "event type and tenant are required".to_string(),
            ));
        }
        if self.queue.is_closed().await {
            return Err(WebhookError::Shutdown);
        }

        let webhooks = self
            .registry
            .list_active(&event.tenant_id, &event.event_type)
            .await?;
        if webhooks.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                "No webhook subscribed to event"
            );
            return Ok(Vec::new());
        }

        let envelope = event.envelope();
        let mut created = Vec::with_capacity(webhooks.len());
        for webhook in webhooks {
            if let Some(attempt) = self.dispatch_to(webhook, &envelope).await? {
                created.push(attempt);
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            deliveries = created.len(),
            "Dispatched event"
        );
        Ok(created)
    }

    async fn dispatch_to(
        &self,
        webhook: Webhook,
        envelope: &EventEnvelope,
    ) -> WebhookResult<Option<DeliveryAttempt>> {
        let key = (webhook.id.clone(), envelope.id.clone());
        if !self.claims.lock().await.insert(key.clone()) {
            tracing::debug!(
                webhook_id = %webhook.id,
                event_id = %envelope.id,
                "Delivery already being dispatched"
            );
            return Ok(None);
        }

        let result = self.create_delivery(webhook, envelope).await;
        self.claims.lock().await.remove(&key);
        result
    }

    async fn create_delivery(
        &self,
        webhook: Webhook,
        envelope: &EventEnvelope,
    ) -> WebhookResult<Option<DeliveryAttempt>> {
        let existing = self
            .store
            .query(&AttemptFilter::new().webhook(&webhook.id).event(&envelope.id).limit(1))
            .await?;
        if !existing.is_empty() {
            tracing::debug!(
                webhook_id = %webhook.id,
                event_id = %envelope.id,
                "Event already dispatched to webhook"
            );
            return Ok(None);
        }

        let attempt = DeliveryAttempt::first(&webhook, envelope.clone(), Utc::now());
        self.store.append(&attempt).await?;

        let job = DeliveryJob::new(attempt.clone(), Arc::new(webhook));
        if let Err(e) = self.queue.enqueue(job).await {
            tracing::warn!(
                webhook_id = %attempt.webhook_id,
                event_id = %attempt.event_id,
                error = %e,
                "Attempt recorded but not queued; it resumes on next start"
            );
        }
        Ok(Some(attempt))
    }

    /// Sends a synthetic `webhook.test` event to one webhook and waits for the result.
    ///
    /// The webhook's active flag and subscriptions are ignored. The attempt is
    /// never retried; it ends `Succeeded` or `Failed`. If no result arrives
    /// within the test timeout a `Failed` attempt with class `Timeout` is
    /// returned and the late result is discarded. The store holds the same
    /// outcome as the one returned.
    ///
    /// # Errors
    ///
    /// [`WebhookError::WebhookNotFound`] for an unknown ID and
    /// [`WebhookError::Shutdown`] when the workers are not running.
    pub async fn send_test_event(&self, webhook_id: &str) -> WebhookResult<DeliveryAttempt> {
        if !self.is_running().await {
            return Err(WebhookError::Shutdown);
        }

        let webhook = self
            .registry
            .get(webhook_id)
            .await?
            .ok_or_else(|| WebhookError::WebhookNotFound(webhook_id.to_string()))?;

        let envelope = EventEnvelope::test_for(&webhook);
        let attempt = DeliveryAttempt::first(&webhook, envelope, Utc::now());
        if self.config.persist_test_deliveries {
            self.store.append(&attempt).await?;
        }

        tracing::info!(webhook_id = %webhook.id, event_id = %attempt.event_id, "Sending test event");

        let (tx, mut rx) = oneshot::channel();
        let job = DeliveryJob::new(attempt.clone(), Arc::new(webhook)).with_reply(tx);
        self.queue.enqueue(job).await?;

        let timeout = self.config.test_event_timeout_duration();
        let result = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(WebhookError::Shutdown),
            Err(_) => {
                // A result sent before the channel closed still wins.
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            webhook_id = %attempt.webhook_id,
                            event_id = %attempt.event_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Test event timed out"
                        );
                        let mut timed_out = attempt;
                        let now = Utc::now();
                        timed_out.start(now)?;
                        timed_out.fail(
                            ErrorClass::Timeout,
                            None,
                            format!("no result within {}ms", timeout.as_millis()),
                            Some(timeout.as_millis() as u64),
                            now,
                        )?;
                        timed_out
                    }
                }
            }
        };

        if self.config.persist_test_deliveries {
            self.store.append(&result).await?;
        }
        Ok(result)
    }

    /// Summarizes deliveries of a tenant's webhooks, or of all webhooks.
    pub async fn summary(&self, tenant_id: Option<&str>) -> WebhookResult<Vec<WebhookSummary>> {
        self.aggregator.summarize(tenant_id, Utc::now()).await
    }

    /// Puts unfinished deliveries from the store back on the queue.
    ///
    /// `Pending` attempts are re-queued. When the workers are stopped,
    /// attempts left `InFlight` by a previous process are failed as
    /// `Interrupted` and follow the retry rules, and `Failed` attempts whose
    /// successor was never recorded are settled. Returns the number of
    /// attempts queued.
    pub async fn resume_pending(&self) -> WebhookResult<usize> {
        if self.is_running().await {
            let pending = self.store.query(&AttemptFilter::new().state(AttemptState::Pending)).await?;
            return self.requeue(pending).await;
        }
        self.recover().await
    }

    async fn recover(&self) -> WebhookResult<usize> {
        let queued_before = self.queue.len().await;

        let orphaned = self
            .store
            .query(&AttemptFilter::new().state(AttemptState::InFlight))
            .await?;
        for mut attempt in orphaned {
            attempt.fail(
                ErrorClass::Interrupted,
                None,
                "delivery interrupted before completion",
                None,
                Utc::now(),
            )?;
            tracing::warn!(
                webhook_id = %attempt.webhook_id,
                event_id = %attempt.event_id,
                attempt_number = attempt.attempt_number,
                "Recovered interrupted delivery"
            );
            self.store.append(&attempt).await?;
            if !attempt.is_test {
                self.settle(attempt).await?;
            }
        }

        let failed = self
            .store
            .query(&AttemptFilter::new().state(AttemptState::Failed).without_tests())
            .await?;
        for attempt in failed {
            let successors = self
                .store
                .query(&AttemptFilter::new().webhook(&attempt.webhook_id).event(&attempt.event_id))
                .await?;
            if successors.iter().all(|a| a.attempt_number <= attempt.attempt_number) {
                self.settle(attempt).await?;
            }
        }

        let pending = self
            .store
            .query(&AttemptFilter::new().state(AttemptState::Pending))
            .await?;
        self.requeue(pending).await?;

        Ok(self.queue.len().await.saturating_sub(queued_before))
    }

    async fn settle(&self, mut attempt: DeliveryAttempt) -> WebhookResult<()> {
        match self.registry.get(&attempt.webhook_id).await? {
            Some(webhook) => {
                self.engine
                    .settle_failure(&mut attempt, &Arc::new(webhook))
                    .await;
            }
            None => {
                attempt.abandon()?;
                self.store.append(&attempt).await?;
            }
        }
        Ok(())
    }

    async fn requeue(&self, pending: Vec<DeliveryAttempt>) -> WebhookResult<usize> {
        let mut queued = 0;
        for mut attempt in pending {
            if attempt.is_test {
                // Nobody is waiting for a stale test result.
                let now = Utc::now();
                attempt.start(now)?;
                attempt.fail(ErrorClass::Interrupted, None, "test delivery expired", None, now)?;
                self.store.append(&attempt).await?;
                continue;
            }

            match self.registry.get(&attempt.webhook_id).await? {
                Some(webhook) => {
                    if self.queue.enqueue(DeliveryJob::new(attempt, Arc::new(webhook))).await? {
                        queued += 1;
                    }
                }
                None => {
                    tracing::error!(
                        webhook_id = %attempt.webhook_id,
                        event_id = %attempt.event_id,
                        "Webhook no longer registered, abandoning delivery"
                    );
                    attempt.fail(
                        ErrorClass::Configuration,
                        None,
                        "webhook no longer registered",
                        None,
                        Utc::now(),
                    )?;
                    self.store.append(&attempt).await?;
                    attempt.abandon()?;
                    self.store.append(&attempt).await?;
                }
            }
        }
        Ok(queued)
    }

    /// Gets the configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Gets the webhook registry.
    pub fn registry(&self) -> &Arc<dyn WebhookRegistry> {
        &self.registry
    }

    /// Gets the delivery store.
    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// Gets the delivery queue.
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }
}
