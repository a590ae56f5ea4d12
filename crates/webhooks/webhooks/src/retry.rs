//! Retry strategies and the retry scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::attempt::{AttemptState, DeliveryAttempt};
use crate::error::WebhookResult;

/// Trait for retry strategies.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay before the attempt following `attempt_number`,
    /// or None if the budget is exhausted.
    fn next_delay(&self, attempt_number: u32) -> Option<Duration>;

    /// Returns the maximum number of attempts per delivery.
    fn max_attempts(&self) -> u32;

    /// Checks if another attempt may follow `attempt_number`.
    fn should_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts()
    }
}

/// Exponential backoff with jitter.
///
/// The delay after attempt `n` is `min(max_delay, base * 2^(n-1))` scaled by
/// a random factor in `[0.5, 1.0]`, so simultaneous failures spread out
/// instead of retrying in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay.
    pub base: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Whether to apply jitter.
    pub jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a new exponential backoff strategy.
    pub fn new() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_delay: Duration::from_secs(300), // 5 minutes
            max_attempts: 5,
            jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the maximum delay.
    pub fn max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Sets the maximum attempts.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Enables or disables jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after `attempt_number`: `min(max_delay, base * 2^(n-1))`.
    pub fn ceiling(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt_number: u32) -> Option<Duration> {
        if !self.should_retry(attempt_number) {
            return None;
        }

        let delay = self.ceiling(attempt_number);
        if self.jitter {
            let factor = rand::rng().random_range(0.5..=1.0);
            Some(delay.mul_f64(factor))
        } else {
            Some(delay)
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// What happens after an attempt failed.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Persist and enqueue this new `Pending` attempt.
    Retry(DeliveryAttempt),
    /// Move the failed attempt to `Abandoned`.
    Abandon(AbandonReason),
}

/// Why a delivery was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The retry budget is used up.
    BudgetExhausted,
    /// The failure class is never retried.
    NotRetryable,
    /// The webhook was deactivated or removed since dispatch.
    WebhookInactive,
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::BudgetExhausted => write!(f, "retry budget exhausted"),
            AbandonReason::NotRetryable => write!(f, "failure is not retryable"),
            AbandonReason::WebhookInactive => write!(f, "webhook is no longer active"),
        }
    }
}

/// Decides whether and when a failed attempt is retried.
///
/// Holds no per-delivery state: every decision is derived from the failed
/// attempt record alone, so pending retries survive a restart as long as
/// their records do.
#[derive(Clone)]
pub struct RetryScheduler {
    strategy: Arc<dyn RetryStrategy>,
}

impl RetryScheduler {
    /// Creates a scheduler around a strategy.
    pub fn new(strategy: Arc<dyn RetryStrategy>) -> Self {
        Self { strategy }
    }

    /// Returns the retry budget.
    pub fn budget(&self) -> u32 {
        self.strategy.max_attempts()
    }

    /// Plans the follow-up of a `Failed` attempt.
    pub fn plan(
        &self,
        failed: &DeliveryAttempt,
        webhook_active: bool,
        now: DateTime<Utc>,
    ) -> WebhookResult<RetryDecision> {
        debug_assert_eq!(failed.state, AttemptState::Failed);

        if failed.error_class.is_some_and(|class| !class.is_retryable()) {
            return Ok(RetryDecision::Abandon(AbandonReason::NotRetryable));
        }

        let Some(delay) = self.strategy.next_delay(failed.attempt_number) else {
            return Ok(RetryDecision::Abandon(AbandonReason::BudgetExhausted));
        };

        if !webhook_active {
            return Ok(RetryDecision::Abandon(AbandonReason::WebhookInactive));
        }

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let scheduled_at = now.checked_add_signed(delay).unwrap_or(now);
        Ok(RetryDecision::Retry(failed.next_attempt(scheduled_at)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::ErrorClass;
    use crate::event::Event;
    use crate::webhook::Webhook;

    fn failed(attempt_number: u32, class: ErrorClass) -> DeliveryAttempt {
        let webhook = Webhook::new("t1", "https://example.com", "s");
        let event = Event::new("order.updated", "t1", serde_json::json!({}));
        let mut attempt = DeliveryAttempt::first(&webhook, event.envelope(), Utc::now());
        attempt.attempt_number = attempt_number;
        let now = Utc::now();
        if class != ErrorClass::Configuration {
            attempt.start(now).unwrap();
        }
        attempt.fail(class, None, "boom", None, now).unwrap();
        attempt
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let strategy = ExponentialBackoff::new()
            .base(Duration::from_secs(2))
            .max_attempts(5)
            .jitter(false);

        assert_eq!(strategy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_secs(4)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_secs(8)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_secs(16)));
        assert_eq!(strategy.next_delay(5), None);
    }

    #[test]
    fn test_ceiling_is_monotonic_and_capped() {
        let strategy = ExponentialBackoff::new().max_attempts(u32::MAX);

        let mut previous = Duration::ZERO;
        for n in 1..64 {
            let ceiling = strategy.ceiling(n);
            assert!(ceiling >= previous);
            assert!(ceiling <= strategy.max_delay);
            previous = ceiling;
        }
        assert_eq!(strategy.ceiling(63), Duration::from_secs(300));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let strategy = ExponentialBackoff::new().max_attempts(20);

        for n in 1..20 {
            let ceiling = strategy.ceiling(n);
            for _ in 0..50 {
                let delay = strategy.next_delay(n).unwrap();
                assert!(delay >= ceiling / 2, "attempt {n}: {delay:?} < {ceiling:?}/2");
                assert!(delay <= ceiling);
                assert!(delay <= strategy.max_delay);
            }
        }
    }

    #[test]
    fn test_scheduler_retries_within_budget() {
        let scheduler = RetryScheduler::new(Arc::new(
            ExponentialBackoff::new().max_attempts(5).jitter(false),
        ));
        let now = Utc::now();

        let decision = scheduler.plan(&failed(1, ErrorClass::ServerError), true, now).unwrap();
        match decision {
            RetryDecision::Retry(next) => {
                assert_eq!(next.attempt_number, 2);
                assert_eq!(next.scheduled_at, now + chrono::Duration::seconds(2));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_scheduler_abandons() {
        let scheduler = RetryScheduler::new(Arc::new(ExponentialBackoff::new().max_attempts(5)));
        let now = Utc::now();

        assert!(matches!(
            scheduler.plan(&failed(5, ErrorClass::ServerError), true, now).unwrap(),
            RetryDecision::Abandon(AbandonReason::BudgetExhausted)
        ));
        assert!(matches!(
            scheduler.plan(&failed(1, ErrorClass::Configuration), true, now).unwrap(),
            RetryDecision::Abandon(AbandonReason::NotRetryable)
        ));
        assert!(matches!(
            scheduler.plan(&failed(2, ErrorClass::Timeout), false, now).unwrap(),
            RetryDecision::Abandon(AbandonReason::WebhookInactive)
        ));
    }

    #[test]
    fn test_rejections_are_retried() {
        let scheduler = RetryScheduler::new(Arc::new(ExponentialBackoff::new()));
        assert!(matches!(
            scheduler.plan(&failed(1, ErrorClass::Rejected), true, Utc::now()).unwrap(),
            RetryDecision::Retry(_)
        ));
    }
}
