//! Delivery engine: runs one attempt through the state machine.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::attempt::{AttemptState, DeliveryAttempt, ErrorClass};
use crate::config::DispatcherConfig;
use crate::queue::{DeliveryJob, DeliveryQueue};
use crate::registry::WebhookRegistry;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::signature::{SIGNATURE_HEADER, WebhookSigner};
use crate::store::DeliveryStore;
use crate::transport::{DeliveryTransport, OutboundRequest};
use crate::webhook::Webhook;

/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";
/// Header carrying the event ID.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Id";
/// Header carrying the attempt ID.
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery";
/// Header carrying the attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Executes delivery attempts and records every transition.
pub struct DeliveryEngine {
    transport: Arc<dyn DeliveryTransport>,
    store: Arc<dyn DeliveryStore>,
    registry: Arc<dyn WebhookRegistry>,
    queue: Arc<DeliveryQueue>,
    scheduler: RetryScheduler,
    config: DispatcherConfig,
}

impl DeliveryEngine {
    /// Creates a new delivery engine.
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        store: Arc<dyn DeliveryStore>,
        registry: Arc<dyn WebhookRegistry>,
        queue: Arc<DeliveryQueue>,
        scheduler: RetryScheduler,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            transport,
            store,
            registry,
            queue,
            scheduler,
            config,
        }
    }

    /// Processes a job taken from the queue.
    ///
    /// Regular deliveries that fail are followed by a retry or abandonment.
    /// Test deliveries are single-shot and end in `Succeeded` or `Failed`.
    ///
    /// When the job carries a reply channel the finished attempt is handed to
    /// the waiting caller, which records the outcome it reports. A result
    /// nobody waits for anymore is dropped unrecorded.
    pub async fn process(&self, job: DeliveryJob) {
        let DeliveryJob {
            mut attempt,
            webhook,
            reply,
        } = job;

        if reply.as_ref().is_some_and(|reply| reply.is_closed()) {
            tracing::debug!(attempt_id = %attempt.id, "Caller stopped waiting, skipping delivery");
            return;
        }

        let finished = self.execute(&mut attempt, &webhook, reply.is_none()).await;

        if let Some(reply) = reply {
            if let Err(late) = reply.send(attempt) {
                tracing::debug!(
                    webhook_id = %late.webhook_id,
                    attempt_id = %late.id,
                    state = %late.state,
                    "Discarding result nobody is waiting for"
                );
            }
            return;
        }

        if !finished {
            return;
        }
        self.record(&attempt).await;

        if attempt.state == AttemptState::Failed && !attempt.is_test {
            self.settle_failure(&mut attempt, &webhook).await;
        }
    }

    /// Runs the HTTP try: `Pending → InFlight → Succeeded | Failed`.
    ///
    /// Records the `InFlight` transition when `record_start` is set. Returns
    /// `true` once the attempt reached `Succeeded` or `Failed`.
    async fn execute(&self, attempt: &mut DeliveryAttempt, webhook: &Webhook, record_start: bool) -> bool {
        let prepared = webhook.validate().and_then(|()| {
            let signer = WebhookSigner::new(&webhook.secret)?;
            let body = attempt.envelope.to_bytes()?;
            Ok((signer, body))
        });

        let (signer, body) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(
                    webhook_id = %attempt.webhook_id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    error = %e,
                    "Webhook cannot be delivered to as configured"
                );
                return attempt
                    .fail(ErrorClass::Configuration, None, e.to_string(), None, Utc::now())
                    .is_ok();
            }
        };

        if let Err(e) = attempt.start(Utc::now()) {
            tracing::error!(attempt_id = %attempt.id, error = %e, "Attempt could not start");
            return false;
        }
        if record_start {
            self.record(attempt).await;
        }

        let timestamp = Utc::now().timestamp();
        let mut headers = vec![
            (SIGNATURE_HEADER.to_string(), signer.sign_header(timestamp, &body)),
            (EVENT_TYPE_HEADER.to_string(), attempt.event_type.clone()),
            (EVENT_ID_HEADER.to_string(), attempt.event_id.clone()),
            (DELIVERY_ID_HEADER.to_string(), attempt.id.clone()),
            (ATTEMPT_HEADER.to_string(), attempt.attempt_number.to_string()),
        ];
        headers.extend(
            webhook
                .metadata
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let timeout = webhook
            .metadata
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| self.config.request_timeout_duration());

        let request = OutboundRequest {
            url: webhook.url.clone(),
            headers,
            body,
            timeout,
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.transport.post(request)).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        let now = Utc::now();

        let transition = match outcome {
            Ok(Ok(resp)) if (200..300).contains(&resp.status) => {
                tracing::info!(
                    webhook_id = %attempt.webhook_id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    status_code = resp.status,
                    latency_ms,
                    "Webhook delivery succeeded"
                );
                attempt.succeed(resp.status, latency_ms, now)
            }
            Ok(Ok(resp)) => {
                let class = ErrorClass::from_status(resp.status);
                let message = match resp.body.as_deref() {
                    Some(body) if !body.is_empty() => format!("HTTP {}: {}", resp.status, body),
                    _ => format!("HTTP {}", resp.status),
                };
                self.log_failure(attempt, class, Some(resp.status), &message, latency_ms);
                attempt.fail(class, Some(resp.status), message, Some(latency_ms), now)
            }
            Ok(Err(e)) => {
                self.log_failure(attempt, e.class, None, &e.message, latency_ms);
                attempt.fail(e.class, None, e.message, Some(latency_ms), now)
            }
            Err(_) => {
                let message = format!("no response within {}ms", timeout.as_millis());
                self.log_failure(attempt, ErrorClass::Timeout, None, &message, latency_ms);
                attempt.fail(ErrorClass::Timeout, None, message, Some(latency_ms), now)
            }
        };

        match transition {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(attempt_id = %attempt.id, error = %e, "Attempt could not finish");
                false
            }
        }
    }

    /// Schedules the next attempt or abandons the delivery.
    pub(crate) async fn settle_failure(&self, attempt: &mut DeliveryAttempt, webhook: &Arc<Webhook>) {
        let active = match self.registry.get(&attempt.webhook_id).await {
            Ok(current) => current.is_some_and(|w| w.active),
            Err(e) => {
                tracing::warn!(
                    webhook_id = %attempt.webhook_id,
                    error = %e,
                    "Registry lookup failed, assuming webhook is still active"
                );
                true
            }
        };

        let decision = match self.scheduler.plan(attempt, active, Utc::now()) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(attempt_id = %attempt.id, error = %e, "Could not plan retry");
                return;
            }
        };

        match decision {
            RetryDecision::Retry(next) => {
                tracing::debug!(
                    webhook_id = %next.webhook_id,
                    event_id = %next.event_id,
                    attempt_number = next.attempt_number,
                    scheduled_at = %next.scheduled_at,
                    "Scheduled webhook retry"
                );
                self.record(&next).await;
                match self.queue.enqueue(DeliveryJob::new(next, webhook.clone())).await {
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        webhook_id = %attempt.webhook_id,
                        event_id = %attempt.event_id,
                        error = %e,
                        "Retry persisted but not queued; it resumes on next start"
                    ),
                }
            }
            RetryDecision::Abandon(reason) => {
                if let Err(e) = attempt.abandon() {
                    tracing::error!(attempt_id = %attempt.id, error = %e, "Could not abandon attempt");
                    return;
                }
                tracing::error!(
                    webhook_id = %attempt.webhook_id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    error_class = ?attempt.error_class,
                    reason = %reason,
                    "Webhook delivery abandoned"
                );
                self.record(attempt).await;
            }
        }
    }

    async fn record(&self, attempt: &DeliveryAttempt) {
        if attempt.is_test && !self.config.persist_test_deliveries {
            return;
        }
        if let Err(e) = self.store.append(attempt).await {
            tracing::error!(
                attempt_id = %attempt.id,
                state = %attempt.state,
                error = %e,
                "Failed to append delivery attempt"
            );
        }
    }

    fn log_failure(
        &self,
        attempt: &DeliveryAttempt,
        class: ErrorClass,
        status_code: Option<u16>,
        message: &str,
        latency_ms: u64,
    ) {
        tracing::warn!(
            webhook_id = %attempt.webhook_id,
            event_id = %attempt.event_id,
            attempt_number = attempt.attempt_number,
            error_class = %class,
            status_code,
            latency_ms,
            error = %message,
            "Webhook delivery failed"
        );
    }
}
