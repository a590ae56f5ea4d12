//! End-to-end delivery tests against a wiremock receiver.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{SECRET, TENANT, fast_config, order_webhook, start};
use hookrelay_webhooks::{
    AttemptFilter, AttemptState, DeliveryStore, ErrorCategory, ErrorClass, Event, EventEnvelope,
    SIGNATURE_HEADER, TEST_EVENT_TYPE, Webhook, WebhookReceiver,
};

async fn receiver(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn hook_url(server: &MockServer) -> String {
    format!("{}/hook", server.uri())
}

// =============================================================================
// Signing
// =============================================================================

#[tokio::test]
async fn test_delivery_is_signed_and_verifiable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(SIGNATURE_HEADER))
        .and(header_exists("X-Webhook-Event-Type"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    let event = Event::new("order.updated", TENANT, json!({ "order_id": 42 }));
    h.dispatcher.dispatch(&event).await.unwrap();
    h.settle().await;

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(signature.starts_with("t="));
    assert!(signature.contains(",v1="));
    assert_eq!(
        request.headers.get("X-Webhook-Event-Type").unwrap(),
        "order.updated"
    );

    let envelope = WebhookReceiver::new(SECRET)
        .unwrap()
        .verify(signature, &request.body)
        .unwrap();
    assert_eq!(envelope.id, event.id);
    assert_eq!(envelope.data["order_id"], 42);
    assert!(!envelope.is_test);

    assert!(WebhookReceiver::new("wrong").unwrap().verify(signature, &request.body).is_err());

    let attempts = h.attempts(&event.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Succeeded);
    assert_eq!(attempts[0].status_code, Some(200));
    assert!(attempts[0].latency_ms.is_some());

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retries_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    let event = Event::new("order.created", TENANT, json!({}));
    h.dispatcher.dispatch(&event).await.unwrap();
    h.settle().await;

    let attempts = h.attempts(&event.id).await;
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    let states: Vec<AttemptState> = attempts.iter().map(|a| a.state).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(
        states,
        vec![
            AttemptState::Failed,
            AttemptState::Failed,
            AttemptState::Failed,
            AttemptState::Succeeded
        ]
    );
    assert!(attempts[..3]
        .iter()
        .all(|a| a.error_class == Some(ErrorClass::ServerError)));

    // Each retry waits for its backoff after the previous failure.
    for pair in attempts.windows(2) {
        assert!(pair[1].scheduled_at > pair[0].completed_at.unwrap());
    }

    let summary = &h.dispatcher.summary(Some(TENANT)).await.unwrap()[0];
    assert_eq!(summary.successes, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.failures, 3);
    assert_eq!(summary.total_events, 1);
    assert_eq!(summary.success_rate, Some(1.0));

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_budget_abandons() {
    let server = receiver(500).await;
    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    let event = Event::new("order.updated", TENANT, json!({}));
    h.dispatcher.dispatch(&event).await.unwrap();
    h.settle().await;

    let attempts = h.attempts(&event.id).await;
    assert_eq!(attempts.len(), 5);
    assert!(attempts[..4].iter().all(|a| a.state == AttemptState::Failed));
    let last = &attempts[4];
    assert_eq!(last.attempt_number, 5);
    assert_eq!(last.state, AttemptState::Abandoned);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    let summary = &h.dispatcher.summary(Some(TENANT)).await.unwrap()[0];
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.success_rate, Some(0.0));
    let failure = summary.last_failure.as_ref().unwrap();
    assert_eq!(failure.at, last.completed_at.unwrap());
    assert_eq!(failure.status_code, Some(500));

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_rejection_is_retried_and_reported() {
    let server = receiver(404).await;
    let h = start(
        fast_config().retry_budget(2),
        vec![order_webhook("w1", &hook_url(&server))],
    )
    .await;
    let event = Event::new("order.updated", TENANT, json!({}));
    h.dispatcher.dispatch(&event).await.unwrap();
    h.settle().await;

    let attempts = h.attempts(&event.id).await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].error_class, Some(ErrorClass::Rejected));
    assert_eq!(
        attempts[1].error_class.unwrap().category(),
        ErrorCategory::PermanentRejection
    );

    let summary = &h.dispatcher.summary(None).await.unwrap()[0];
    assert_eq!(summary.permanent_rejections, 1);

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Configuration failures
// =============================================================================

#[tokio::test]
async fn test_invalid_url_abandons_without_network() {
    let server = receiver(200).await;
    let broken = Webhook::new(TENANT, "ftp://files.example/hook", SECRET)
        .with_id("broken")
        .events(["order.updated"]);
    let h = start(fast_config(), vec![broken]).await;

    let event = Event::new("order.updated", TENANT, json!({}));
    h.dispatcher.dispatch(&event).await.unwrap();
    h.settle().await;

    let attempts = h.attempts(&event.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].state, AttemptState::Abandoned);
    assert_eq!(attempts[0].error_class, Some(ErrorClass::Configuration));
    assert!(server.received_requests().await.unwrap().is_empty());

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Idempotency and fan-out
// =============================================================================

#[tokio::test]
async fn test_concurrent_duplicate_dispatch_delivers_once() {
    let server = receiver(200).await;
    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    let event = Event::new("order.updated", TENANT, json!({}));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = h.dispatcher.clone();
            let event = event.clone();
            tokio::spawn(async move { dispatcher.dispatch(&event).await.unwrap().len() })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        created += handle.await.unwrap();
    }
    h.settle().await;

    assert_eq!(created, 1);
    assert_eq!(h.attempts(&event.id).await.len(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_respects_tenant_and_subscription() {
    let server = receiver(200).await;
    let url = hook_url(&server);
    let h = start(
        fast_config(),
        vec![
            order_webhook("w1", &url),
            Webhook::new(TENANT, &url, SECRET).with_id("w2").all_events(),
            Webhook::new(TENANT, &url, SECRET).with_id("w3").events(["user.created"]),
            Webhook::new("t2", &url, SECRET).with_id("w4").all_events(),
        ],
    )
    .await;

    let event = Event::new("order.updated", TENANT, json!({}));
    let created = h.dispatcher.dispatch(&event).await.unwrap();
    let mut targets: Vec<&str> = created.iter().map(|a| a.webhook_id.as_str()).collect();
    targets.sort_unstable();
    assert_eq!(targets, vec!["w1", "w2"]);

    h.settle().await;
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Deactivation
// =============================================================================

#[tokio::test]
async fn test_deactivated_webhook_gets_no_new_deliveries() {
    let server = receiver(200).await;
    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    h.registry.set_active("w1", false).await.unwrap();

    let created = h
        .dispatcher
        .dispatch(&Event::new("order.updated", TENANT, json!({})))
        .await
        .unwrap();
    assert!(created.is_empty());

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_deactivation_stops_retries() {
    let server = receiver(503).await;
    let config = fast_config().base_delay(Duration::from_millis(300));
    let h = start(config, vec![order_webhook("w1", &hook_url(&server))]).await;
    let event = Event::new("order.updated", TENANT, json!({}));
    h.dispatcher.dispatch(&event).await.unwrap();

    // Wait for the first failure, then deactivate while the retry is waiting.
    for _ in 0..200 {
        let failed = h
            .store
            .query(&AttemptFilter::new().event(&event.id).state(AttemptState::Failed))
            .await
            .unwrap();
        if !failed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.registry.set_active("w1", false).await.unwrap();
    h.settle().await;

    let attempts = h.attempts(&event.id).await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].state, AttemptState::Abandoned);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_per_webhook_cap_serializes_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .mount(&server)
        .await;

    let strict = order_webhook("w1", &hook_url(&server)).max_concurrency(1);
    let h = start(fast_config(), vec![strict]).await;
    for n in 0..3 {
        h.dispatcher
            .dispatch(&Event::new("order.updated", TENANT, json!({ "n": n })))
            .await
            .unwrap();
    }
    h.settle().await;

    let mut attempts = h
        .store
        .query(&AttemptFilter::new().webhook("w1"))
        .await
        .unwrap();
    assert_eq!(attempts.len(), 3);
    attempts.sort_by_key(|a| a.started_at);
    for pair in attempts.windows(2) {
        assert!(pair[1].started_at.unwrap() >= pair[0].completed_at.unwrap());
    }

    h.dispatcher.shutdown().await;
}

// =============================================================================
// Test events
// =============================================================================

#[tokio::test]
async fn test_send_test_event_succeeds() {
    let server = receiver(200).await;
    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server)).deactivated()]).await;

    let attempt = h.dispatcher.send_test_event("w1").await.unwrap();
    assert_eq!(attempt.state, AttemptState::Succeeded);
    assert!(attempt.is_test);

    let requests = server.received_requests().await.unwrap();
    let envelope: EventEnvelope = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(envelope.event_type, TEST_EVENT_TYPE);
    assert!(envelope.is_test);

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_send_test_event_to_unreachable_host() {
    let h = start(fast_config(), vec![order_webhook("w1", "http://127.0.0.1:1/hook")]).await;

    let attempt = h.dispatcher.send_test_event("w1").await.unwrap();
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(
        attempt.error_class.unwrap().category(),
        ErrorCategory::TransientNetwork
    );
    h.settle().await;

    // Recorded for diagnostics, never retried, never summarized.
    let recorded = h
        .store
        .query(&AttemptFilter::new().webhook("w1"))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].is_test);

    let summary = &h.dispatcher.summary(Some(TENANT)).await.unwrap()[0];
    assert_eq!(summary.total_attempts, 0);
    assert_eq!(summary.success_rate, None);

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_summary_without_attempts() {
    let h = start(fast_config(), vec![order_webhook("w1", "https://example.com/hook")]).await;

    let summaries = h.dispatcher.summary(Some(TENANT)).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_attempts, 0);
    assert_eq!(summaries[0].success_rate, None);

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shared_dispatcher_across_tasks() {
    let server = receiver(200).await;
    let h = start(fast_config(), vec![order_webhook("w1", &hook_url(&server))]).await;
    let dispatcher = Arc::clone(&h.dispatcher);

    let handles: Vec<_> = (0..10)
        .map(|n| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&Event::new("order.updated", TENANT, json!({ "n": n })))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    h.settle().await;

    let succeeded = h
        .store
        .query(&AttemptFilter::new().state(AttemptState::Succeeded))
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 10);

    h.dispatcher.shutdown().await;
}
