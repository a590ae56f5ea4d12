//! Scheduled delivery queue.
//!
//! Holds attempts waiting for their scheduled time or for a free worker.
//! Waiting attempts do not occupy a worker; workers only take attempts that
//! are due and whose webhook is below its concurrency cap.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, oneshot};

use crate::attempt::DeliveryAttempt;
use crate::error::{WebhookError, WebhookResult};
use crate::webhook::Webhook;

/// An attempt handed to the worker pool.
#[derive(Debug)]
pub struct DeliveryJob {
    /// The `Pending` attempt to run.
    pub attempt: DeliveryAttempt,
    /// Webhook snapshot taken at dispatch time.
    pub webhook: Arc<Webhook>,
    /// Receives the finished attempt, for callers that wait on the result.
    pub reply: Option<oneshot::Sender<DeliveryAttempt>>,
}

impl DeliveryJob {
    /// Creates a fire-and-forget job.
    pub fn new(attempt: DeliveryAttempt, webhook: Arc<Webhook>) -> Self {
        Self {
            attempt,
            webhook,
            reply: None,
        }
    }

    /// Attaches a result channel.
    pub fn with_reply(mut self, reply: oneshot::Sender<DeliveryAttempt>) -> Self {
        self.reply = Some(reply);
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<(DateTime<Utc>, u64), DeliveryJob>,
    tracked: HashSet<String>,
    in_flight: HashMap<String, usize>,
    in_flight_total: usize,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn has_capacity(&self, webhook: &Webhook) -> bool {
        match webhook.metadata.max_concurrency {
            Some(cap) => self.in_flight.get(&webhook.id).copied().unwrap_or(0) < cap.max(1),
            None => true,
        }
    }
}

/// In-memory queue ordered by scheduled-at time.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeliveryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a job.
    ///
    /// Returns `false` without enqueueing when the same attempt is already
    /// queued or in flight.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Shutdown`] once the queue is closed.
    pub async fn enqueue(&self, job: DeliveryJob) -> WebhookResult<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(WebhookError::Shutdown);
        }
        if !state.tracked.insert(job.attempt.id.clone()) {
            return Ok(false);
        }

        state.seq += 1;
        let key = (job.attempt.scheduled_at, state.seq);
        state.pending.insert(key, job);
        drop(state);

        self.notify.notify_one();
        Ok(true)
    }

    /// Takes the earliest due job whose webhook has spare capacity.
    ///
    /// The job counts as in flight until [`complete`](Self::complete) is called.
    pub async fn next_ready(&self, now: DateTime<Utc>) -> Option<DeliveryJob> {
        let mut state = self.state.lock().await;

        let key = state
            .pending
            .iter()
            .take_while(|((scheduled_at, _), _)| *scheduled_at <= now)
            .find(|(_, job)| state.has_capacity(&job.webhook))
            .map(|(key, _)| *key)?;

        let job = state.pending.remove(&key)?;
        *state.in_flight.entry(job.webhook.id.clone()).or_insert(0) += 1;
        state.in_flight_total += 1;
        Some(job)
    }

    /// Releases the in-flight slot taken by [`next_ready`](Self::next_ready).
    pub async fn complete(&self, webhook_id: &str, attempt_id: &str) {
        let mut state = self.state.lock().await;
        state.tracked.remove(attempt_id);
        if let Some(count) = state.in_flight.get_mut(webhook_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.in_flight.remove(webhook_id);
            }
        }
        state.in_flight_total = state.in_flight_total.saturating_sub(1);
        drop(state);

        self.notify.notify_one();
    }

    /// Earliest scheduled time strictly after `now`, if any.
    pub async fn next_wake(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .pending
            .keys()
            .map(|(scheduled_at, _)| *scheduled_at)
            .find(|scheduled_at| *scheduled_at > now)
    }

    /// Waits until a job is enqueued or a slot is released.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Whether the attempt is queued or in flight.
    pub async fn contains(&self, attempt_id: &str) -> bool {
        self.state.lock().await.tracked.contains(attempt_id)
    }

    /// Number of waiting jobs.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Whether nothing is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of jobs currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight_total
    }

    /// Whether nothing is waiting or in flight.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.in_flight_total == 0
    }

    /// Whether [`close`](Self::close) was called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Stops accepting jobs. Waiting jobs stay queued but are no longer taken
    /// once the workers stop.
    ///
    /// Jobs with a reply channel are dropped, so their callers see the
    /// shutdown instead of waiting for a result that never comes.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;

        let awaited: Vec<_> = state
            .pending
            .iter()
            .filter(|(_, job)| job.reply.is_some())
            .map(|(key, _)| *key)
            .collect();
        for key in awaited {
            if let Some(job) = state.pending.remove(&key) {
                state.tracked.remove(&job.attempt.id);
            }
        }
        drop(state);

        self.notify.notify_waiters();
    }
}
