//! Delivery store trait for the attempt log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::attempt::{AttemptState, DeliveryAttempt};
use crate::error::WebhookResult;

/// Append-only log of delivery attempt snapshots.
///
/// Every state transition of an attempt is appended. Queries see the latest
/// snapshot of each attempt; [`history`](DeliveryStore::history) returns all
/// of them. Implementations must accept concurrent appends.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Appends an attempt snapshot.
    async fn append(&self, attempt: &DeliveryAttempt) -> WebhookResult<()>;

    /// Returns the latest snapshot of every attempt matching the filter,
    /// in first-append order.
    async fn query(&self, filter: &AttemptFilter) -> WebhookResult<Vec<DeliveryAttempt>>;

    /// Returns every snapshot appended for one attempt, oldest first.
    async fn history(&self, attempt_id: &str) -> WebhookResult<Vec<DeliveryAttempt>>;

    /// Drops attempts scheduled before the cutoff. Returns how many attempts were removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> WebhookResult<usize>;
}

/// Filter for [`DeliveryStore::query`].
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    /// Only attempts of this tenant.
    pub tenant_id: Option<String>,
    /// Only attempts to this webhook.
    pub webhook_id: Option<String>,
    /// Only attempts of this event.
    pub event_id: Option<String>,
    /// Only attempts currently in one of these states. Empty means any.
    pub states: Vec<AttemptState>,
    /// Only attempts scheduled at or after this time.
    pub scheduled_since: Option<DateTime<Utc>>,
    /// Leave out diagnostic test deliveries.
    pub exclude_tests: bool,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl AttemptFilter {
    /// Matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a tenant.
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Restricts to a webhook.
    pub fn webhook(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }

    /// Restricts to an event.
    pub fn event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Restricts to a state. May be called repeatedly.
    pub fn state(mut self, state: AttemptState) -> Self {
        self.states.push(state);
        self
    }

    /// Restricts to attempts scheduled at or after `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.scheduled_since = Some(since);
        self
    }

    /// Leaves out test deliveries.
    pub fn without_tests(mut self) -> Self {
        self.exclude_tests = true;
        self
    }

    /// Caps the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks a single attempt against the filter (ignores `limit`).
    pub fn matches(&self, attempt: &DeliveryAttempt) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| &attempt.tenant_id == t)
            && self.webhook_id.as_ref().is_none_or(|w| &attempt.webhook_id == w)
            && self.event_id.as_ref().is_none_or(|e| &attempt.event_id == e)
            && (self.states.is_empty() || self.states.contains(&attempt.state))
            && self.scheduled_since.is_none_or(|since| attempt.scheduled_at >= since)
            && !(self.exclude_tests && attempt.is_test)
    }
}

/// In-memory attempt log shared by store implementations.
///
/// Keeps every appended snapshot plus an index of the latest snapshot per
/// attempt.
#[derive(Debug, Default)]
pub struct AttemptLog {
    snapshots: Vec<DeliveryAttempt>,
    latest: Vec<DeliveryAttempt>,
    index: HashMap<String, usize>,
}

impl AttemptLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a snapshot.
    pub fn append(&mut self, attempt: DeliveryAttempt) {
        match self.index.get(&attempt.id) {
            Some(&pos) => self.latest[pos] = attempt.clone(),
            None => {
                self.index.insert(attempt.id.clone(), self.latest.len());
                self.latest.push(attempt.clone());
            }
        }
        self.snapshots.push(attempt);
    }

    /// Latest snapshots matching a filter.
    pub fn query(&self, filter: &AttemptFilter) -> Vec<DeliveryAttempt> {
        self.latest
            .iter()
            .filter(|a| filter.matches(a))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// All snapshots of one attempt.
    pub fn history(&self, attempt_id: &str) -> Vec<DeliveryAttempt> {
        self.snapshots
            .iter()
            .filter(|a| a.id == attempt_id)
            .cloned()
            .collect()
    }

    /// Drops attempts scheduled before the cutoff.
    pub fn prune(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.latest.len();
        self.latest.retain(|a| a.scheduled_at >= older_than);
        self.snapshots.retain(|a| a.scheduled_at >= older_than);
        self.index = self
            .latest
            .iter()
            .enumerate()
            .map(|(pos, a)| (a.id.clone(), pos))
            .collect();
        before - self.latest.len()
    }

    /// Every snapshot, in append order.
    pub fn snapshots(&self) -> &[DeliveryAttempt] {
        &self.snapshots
    }

    /// Number of distinct attempts.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// Whether the log holds no attempts.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// In-memory delivery store for testing.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    log: RwLock<AttemptLog>,
}

impl InMemoryDeliveryStore {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn append(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let mut log = self.log.write().await;
        log.append(attempt.clone());
        Ok(())
    }

    async fn query(&self, filter: &AttemptFilter) -> WebhookResult<Vec<DeliveryAttempt>> {
        let log = self.log.read().await;
        Ok(log.query(filter))
    }

    async fn history(&self, attempt_id: &str) -> WebhookResult<Vec<DeliveryAttempt>> {
        let log = self.log.read().await;
        Ok(log.history(attempt_id))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> WebhookResult<usize> {
        let mut log = self.log.write().await;
        Ok(log.prune(older_than))
    }
}
