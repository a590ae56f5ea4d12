//! Dispatcher configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::ExponentialBackoff;

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum concurrent in-flight HTTP calls across all webhooks.
    pub max_in_flight: usize,
    /// Maximum attempts per (webhook, event), first try included.
    pub retry_budget: u32,
    /// Backoff base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to jitter backoff delays.
    pub jitter: bool,
    /// Default request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// How long a test send waits for its result, in milliseconds.
    pub test_event_timeout_ms: u64,
    /// Idle worker wake-up interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Trailing window for delivery summaries, in days.
    pub summary_window_days: u32,
    /// Whether test deliveries are written to the delivery store.
    pub persist_test_deliveries: bool,
    /// User-Agent header sent with deliveries.
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 50,
            retry_budget: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            jitter: true,
            request_timeout_ms: 10_000,
            test_event_timeout_ms: 15_000,
            poll_interval_ms: 1_000,
            summary_window_days: 30,
            persist_test_deliveries: true,
            user_agent: format!("hookrelay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DispatcherConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool size.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Sets the retry budget.
    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the backoff base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff cap.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enables or disables backoff jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the default request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the test send timeout.
    pub fn test_event_timeout(mut self, timeout: Duration) -> Self {
        self.test_event_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the poll interval.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the summary window.
    pub fn summary_window_days(mut self, days: u32) -> Self {
        self.summary_window_days = days;
        self
    }

    /// Sets whether test deliveries are persisted.
    pub fn persist_test_deliveries(mut self, persist: bool) -> Self {
        self.persist_test_deliveries = persist;
        self
    }

    /// Default request timeout.
    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Test send timeout.
    pub fn test_event_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.test_event_timeout_ms)
    }

    /// Idle worker wake-up interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Summary window.
    pub fn summary_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.summary_window_days))
    }

    /// Worker count, at least one.
    pub fn worker_count(&self) -> usize {
        self.max_in_flight.max(1)
    }

    /// Backoff strategy described by this configuration.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .max_attempts(self.retry_budget)
            .jitter(self.jitter)
    }
}
