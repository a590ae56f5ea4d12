//! Per-webhook delivery summaries computed from the attempt log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::attempt::{AttemptState, DeliveryAttempt, ErrorCategory, ErrorClass};
use crate::error::WebhookResult;
use crate::registry::WebhookRegistry;
use crate::store::{AttemptFilter, DeliveryStore};
use crate::webhook::Webhook;

/// Most recent abandoned delivery of a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// When the final attempt completed.
    pub at: DateTime<Utc>,
    /// Failure classification.
    pub error_class: Option<ErrorClass>,
    /// HTTP status of the final attempt, if any.
    pub status_code: Option<u16>,
    /// Failure detail.
    pub reason: Option<String>,
}

/// Delivery health of one webhook over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSummary {
    /// Webhook ID.
    pub webhook_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Target URL.
    pub url: String,
    /// Whether the webhook currently receives new events.
    pub active: bool,
    /// Start of the summarized window.
    pub window_start: DateTime<Utc>,
    /// End of the summarized window.
    pub window_end: DateTime<Utc>,
    /// Distinct events dispatched to the webhook.
    pub total_events: usize,
    /// Attempt records, retries included.
    pub total_attempts: usize,
    /// Succeeded attempts.
    pub successes: usize,
    /// Failed tries that were followed by a retry.
    pub failures: usize,
    /// Deliveries given up on.
    pub abandoned: usize,
    /// Abandoned deliveries whose final answer was a 4xx.
    pub permanent_rejections: usize,
    /// Events with neither a success nor an abandonment yet.
    pub in_progress: usize,
    /// `successes / (successes + abandoned)`; `None` when nothing has finished.
    pub success_rate: Option<f64>,
    /// Median latency of succeeded attempts.
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency of succeeded attempts.
    pub latency_p95_ms: Option<u64>,
    /// Mean latency of succeeded attempts.
    pub average_latency_ms: Option<u64>,
    /// Most recent abandoned delivery.
    pub last_failure: Option<FailureInfo>,
    /// Failed or abandoned attempts since the last success.
    pub failure_streak: usize,
}

impl WebhookSummary {
    fn from_attempts(
        webhook: &Webhook,
        attempts: &[DeliveryAttempt],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        let count = |state: AttemptState| attempts.iter().filter(|a| a.state == state).count();
        let successes = count(AttemptState::Succeeded);
        let failures = count(AttemptState::Failed);
        let abandoned = count(AttemptState::Abandoned);

        let permanent_rejections = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Abandoned)
            .filter(|a| {
                a.error_class
                    .is_some_and(|c| c.category() == ErrorCategory::PermanentRejection)
            })
            .count();

        let events: HashSet<&str> = attempts.iter().map(|a| a.event_id.as_str()).collect();
        let settled: HashSet<&str> = attempts
            .iter()
            .filter(|a| a.state.is_terminal())
            .map(|a| a.event_id.as_str())
            .collect();

        let finished = successes + abandoned;
        let success_rate = (finished > 0).then(|| successes as f64 / finished as f64);

        let mut latencies: Vec<u64> = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Succeeded)
            .filter_map(|a| a.latency_ms)
            .collect();
        latencies.sort_unstable();
        let average_latency_ms = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<u64>() / latencies.len() as u64);

        let last_failure = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Abandoned)
            .filter_map(|a| a.completed_at.map(|at| (at, a)))
            .max_by_key(|(at, _)| *at)
            .map(|(at, a)| FailureInfo {
                at,
                error_class: a.error_class,
                status_code: a.status_code,
                reason: a.error_message.clone(),
            });

        Self {
            webhook_id: webhook.id.clone(),
            tenant_id: webhook.tenant_id.clone(),
            url: webhook.url.clone(),
            active: webhook.active,
            window_start,
            window_end,
            total_events: events.len(),
            total_attempts: attempts.len(),
            successes,
            failures,
            abandoned,
            permanent_rejections,
            in_progress: events.difference(&settled).count(),
            success_rate,
            latency_p50_ms: percentile(&latencies, 50),
            latency_p95_ms: percentile(&latencies, 95),
            average_latency_ms,
            last_failure,
            failure_streak: failure_streak(attempts),
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}

fn failure_streak(attempts: &[DeliveryAttempt]) -> usize {
    let mut finished: Vec<&DeliveryAttempt> = attempts
        .iter()
        .filter(|a| a.completed_at.is_some() && a.state.is_finished())
        .collect();
    finished.sort_by_key(|a| a.completed_at);

    finished
        .iter()
        .rev()
        .take_while(|a| a.state != AttemptState::Succeeded)
        .count()
}

/// Computes [`WebhookSummary`] values on demand.
pub struct DeliverySummaryAggregator {
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn DeliveryStore>,
    window: chrono::Duration,
}

impl DeliverySummaryAggregator {
    /// Creates an aggregator over a trailing window.
    pub fn new(
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn DeliveryStore>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            store,
            window,
        }
    }

    /// Summarizes every registered webhook of a tenant (or of all tenants).
    ///
    /// Test deliveries never count. Webhooks without attempts in the window
    /// are still listed, with an undefined success rate.
    pub async fn summarize(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> WebhookResult<Vec<WebhookSummary>> {
        let window_start = now - self.window;
        let webhooks = self.registry.list(tenant_id).await?;

        let mut filter = AttemptFilter::new().since(window_start).without_tests();
        if let Some(tenant_id) = tenant_id {
            filter = filter.tenant(tenant_id);
        }
        let attempts = self.store.query(&filter).await?;

        let mut by_webhook: HashMap<&str, Vec<DeliveryAttempt>> = HashMap::new();
        for attempt in &attempts {
            by_webhook
                .entry(attempt.webhook_id.as_str())
                .or_default()
                .push(attempt.clone());
        }

        Ok(webhooks
            .iter()
            .map(|webhook| {
                let attempts = by_webhook
                    .get(webhook.id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                WebhookSummary::from_attempts(webhook, attempts, window_start, now)
            })
            .collect())
    }
}
