//! Fixed-size worker pool draining the delivery queue.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryEngine;
use crate::queue::DeliveryQueue;

/// Running delivery workers.
///
/// The number of workers bounds the number of concurrent HTTP requests.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on the current runtime.
    pub fn spawn(
        engine: Arc<DeliveryEngine>,
        queue: Arc<DeliveryQueue>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    engine.clone(),
                    queue.clone(),
                    poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::debug!(workers, "Started webhook delivery workers");
        Self { shutdown, handles }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stops taking new jobs and waits for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }
        tracing::debug!("Webhook delivery workers stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<DeliveryEngine>,
    queue: Arc<DeliveryQueue>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Some(job) = queue.next_ready(Utc::now()).await {
            let webhook_id = job.webhook.id.clone();
            let attempt_id = job.attempt.id.clone();
            tracing::trace!(worker_id, %webhook_id, %attempt_id, "Picked up delivery");

            engine.process(job).await;
            queue.complete(&webhook_id, &attempt_id).await;
            continue;
        }

        let now = Utc::now();
        let wait = queue
            .next_wake(now)
            .await
            .and_then(|at| (at - now).to_std().ok())
            .map_or(poll_interval, |until| until.min(poll_interval));

        tokio::select! {
            _ = queue.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(worker_id, "Delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::{AttemptState, DeliveryAttempt};
    use crate::config::DispatcherConfig;
    use crate::event::Event;
    use crate::queue::DeliveryJob;
    use crate::registry::InMemoryWebhookRegistry;
    use crate::retry::RetryScheduler;
    use crate::store::{AttemptFilter, DeliveryStore, InMemoryDeliveryStore};
    use crate::transport::{DeliveryTransport, OutboundRequest, TransportError, TransportResponse};
    use crate::webhook::Webhook;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl DeliveryTransport for AlwaysOk {
        async fn post(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                body: None,
            })
        }
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let webhook = Webhook::new("t1", "https://example.com/hook", "s").with_id("w1");
        let store = Arc::new(InMemoryDeliveryStore::new());
        let queue = Arc::new(DeliveryQueue::new());
        let config = DispatcherConfig::default();
        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(AlwaysOk),
            store.clone(),
            Arc::new(InMemoryWebhookRegistry::with_webhooks([webhook.clone()])),
            queue.clone(),
            RetryScheduler::new(Arc::new(config.backoff())),
            config,
        ));
        let pool = WorkerPool::spawn(engine, queue.clone(), 2, Duration::from_millis(10));
        assert_eq!(pool.size(), 2);

        let webhook = Arc::new(webhook);
        for _ in 0..3 {
            let event = Event::new("order.updated", "t1", serde_json::json!({}));
            let attempt = DeliveryAttempt::first(&webhook, event.envelope(), Utc::now());
            queue
                .enqueue(DeliveryJob::new(attempt, webhook.clone()))
                .await
                .unwrap();
        }

        for _ in 0..200 {
            if queue.is_idle().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let succeeded = store
            .query(&AttemptFilter::new().state(AttemptState::Succeeded))
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 3);
    }
}
