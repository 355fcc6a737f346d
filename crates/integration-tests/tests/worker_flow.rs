//! Request/response flow through a running worker
//!
//! Every scenario drives `Worker::run` end to end: in-memory broker in front,
//! scripted upstream behind.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use vouchers_core::application::processor::UpstreamError;
use vouchers_core::application::worker::constants::{
    DEAD_LETTER_REASON_HEADER, DEFAULT_UPSTREAM_PATH, ORIGINAL_QUEUE_HEADER,
};
use vouchers_core::application::worker::PROCESSING_PANICKED_REASON;
use vouchers_core::application::{ForwardProcessor, RequestProcessor, UpstreamCaller};
use vouchers_core::domain::{ErrorReason, IncomingMessage, RequestMessage, ResponseMessage};
use vouchers_core::port::broker::mocks::{BrokerEvent, InMemoryBroker};
use vouchers_core::port::upstream::mocks::ScriptedUpstream;
use vouchers_core::port::{HttpMethod, TransportError};

fn forward(upstream: &Arc<ScriptedUpstream>) -> Arc<dyn RequestProcessor> {
    let caller = UpstreamCaller::new(upstream.clone(), upstream_policy());
    Arc::new(ForwardProcessor::new(caller, DEFAULT_UPSTREAM_PATH))
}

/// Panics on every request it is given
#[derive(Default)]
struct PanickingProcessor {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestProcessor for PanickingProcessor {
    async fn process(&self, _request: &RequestMessage) -> Result<ResponseMessage, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("processor blew up");
    }
}

fn request(id: &str) -> IncomingMessage {
    IncomingMessage::new(format!(
        r#"{{"id":"{}","payload":{{"voucherCode":"X1"}}}}"#,
        id
    ))
}

#[tokio::test]
async fn test_valid_voucher_answered_ok() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, request("abc123"));
    assert!(broker.wait_for_published(RESPONSES, 1, WAIT).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    let responses = broker.published(RESPONSES);
    assert_eq!(
        body_json(&responses[0]),
        json!({"id": "abc123", "status": "ok", "result": {"valid": true}})
    );
    assert_eq!(responses[0].correlation_id.as_deref(), Some("abc123"));

    let sent = upstream.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, HttpMethod::Post);
    assert_eq!(sent[0].path, DEFAULT_UPSTREAM_PATH);
    assert_eq!(sent[0].body, Some(json!({"voucherCode": "X1"})));
    assert_eq!(sent[0].correlation_id.as_deref(), Some("abc123"));

    assert!(running.stop().await.is_ok());
    assert_eq!(broker.queue_len(REQUESTS), 0);
}

#[tokio::test]
async fn test_upstream_unavailable_acked_after_error_response() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::status(503));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, request("abc123"));
    assert!(broker.wait_for_published(RESPONSES, 1, WAIT).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    assert_eq!(
        body_json(&broker.published(RESPONSES)[0]),
        json!({"id": "abc123", "status": "error", "reason": "upstream_unavailable"})
    );
    assert_eq!(upstream.call_count(), 3);

    // Acknowledge-last: the response is confirmed before the request is settled
    assert_eq!(
        broker.events(),
        vec![
            BrokerEvent::Published {
                queue: RESPONSES.to_string(),
                correlation_id: Some("abc123".to_string()),
            },
            BrokerEvent::Acked {
                correlation_id: Some("abc123".to_string()),
            },
        ]
    );

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(
        ScriptedUpstream::ok_json(json!({"valid": false}))
            .then(Err(TransportError::ConnectionRefused("refused".to_string())))
            .then_status(429),
    );
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, request("r-1"));
    assert!(broker.wait_for_published(RESPONSES, 1, WAIT).await);

    let response = decode(&broker.published(RESPONSES)[0]);
    assert!(response.is_ok());
    assert_eq!(upstream.call_count(), 3);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::status(404));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, request("missing"));
    assert!(broker.wait_for_published(RESPONSES, 1, WAIT).await);

    let response = decode(&broker.published(RESPONSES)[0]);
    assert_eq!(response.reason(), Some(ErrorReason::UpstreamRejected));
    assert_eq!(
        body_json(&broker.published(RESPONSES)[0])["detail"],
        json!("Upstream rejected the request with status 404")
    );
    assert_eq!(upstream.call_count(), 1);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_malformed_request_dead_lettered_without_response() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, IncomingMessage::new("{not json"));
    broker.push(REQUESTS, request("after-bad"));
    assert!(broker.wait_for_published(RESPONSES, 1, WAIT).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    let dead = broker.published(DEAD_LETTERS);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"{not json".to_vec());
    assert_eq!(dead[0].header(DEAD_LETTER_REASON_HEADER), Some("invalid_json"));
    assert_eq!(dead[0].header(ORIGINAL_QUEUE_HEADER), Some(REQUESTS));

    // Only the valid request was answered or forwarded
    let responses = broker.published(RESPONSES);
    assert_eq!(responses.len(), 1);
    assert_eq!(decode(&responses[0]).id.as_str(), "after-bad");
    assert_eq!(upstream.call_count(), 1);
    assert_eq!(broker.queue_len(REQUESTS), 0);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_request_without_id_dead_lettered() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, IncomingMessage::new(r#"{"payload":{"voucherCode":"X1"}}"#));
    assert!(broker.wait_for_published(DEAD_LETTERS, 1, WAIT).await);

    let dead = broker.published(DEAD_LETTERS);
    assert_eq!(
        dead[0].header(DEAD_LETTER_REASON_HEADER),
        Some("missing_correlation_id")
    );
    assert!(broker.published(RESPONSES).is_empty());
    assert_eq!(upstream.call_count(), 0);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_prefetch_bounds_in_flight_messages() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(
        ScriptedUpstream::ok_json(json!({"valid": true})).with_delay(Duration::from_millis(40)),
    );
    let running = start(&broker, config().with_prefetch(4), forward(&upstream));

    for i in 0..12 {
        broker.push(REQUESTS, request(&format!("req-{}", i)));
    }
    assert!(broker.wait_for_published(RESPONSES, 12, Duration::from_secs(5)).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    let window = running.worker.window();
    assert!(broker.max_unacked() <= 4, "max unacked {}", broker.max_unacked());
    assert!(window.peak() <= 4);
    // Work actually overlapped
    assert!(window.peak() >= 2, "peak {}", window.peak());

    // Every request answered exactly once, whatever the order
    let mut ids: Vec<String> = broker
        .published(RESPONSES)
        .iter()
        .map(|m| decode(m).id.as_str().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 12);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_publish_failures_requeue_then_dead_letter() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));
    assert!(broker.wait_until(WAIT, |b| b.is_connected()).await);

    // Three response publishes fail; the fourth publish is the dead letter
    broker.fail_next_publishes(3);
    broker.push(REQUESTS, request("stuck"));

    assert!(broker.wait_for_published(DEAD_LETTERS, 1, WAIT).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    let dead = broker.published(DEAD_LETTERS);
    assert_eq!(dead[0].header(DEAD_LETTER_REASON_HEADER), Some("publish_failed"));
    assert!(broker.published(RESPONSES).is_empty());
    assert_eq!(upstream.call_count(), 3);

    let settles: Vec<BrokerEvent> = broker
        .events()
        .into_iter()
        .filter(|e| !matches!(e, BrokerEvent::Published { .. }))
        .collect();
    let stuck = Some("stuck".to_string());
    assert_eq!(
        settles,
        vec![
            BrokerEvent::Rejected {
                correlation_id: stuck.clone(),
                requeue: true,
            },
            BrokerEvent::Rejected {
                correlation_id: stuck.clone(),
                requeue: true,
            },
            BrokerEvent::Acked {
                correlation_id: stuck,
            },
        ]
    );

    assert!(running.stop().await.is_ok());
    assert_eq!(broker.queue_len(REQUESTS), 0);
}

#[tokio::test]
async fn test_panicking_processor_dead_lettered_after_max_attempts() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(PanickingProcessor::default());
    let running = start(
        &broker,
        config().with_max_delivery_attempts(3),
        processor.clone(),
    );

    broker.push(REQUESTS, request("poison"));
    assert!(broker.wait_for_published(DEAD_LETTERS, 1, WAIT).await);
    assert!(broker.wait_until(WAIT, |b| b.unacked_count() == 0).await);

    let dead = broker.published(DEAD_LETTERS);
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].header(DEAD_LETTER_REASON_HEADER),
        Some(PROCESSING_PANICKED_REASON)
    );
    assert_eq!(dead[0].header(ORIGINAL_QUEUE_HEADER), Some(REQUESTS));
    assert!(broker.published(RESPONSES).is_empty());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

    assert!(running.stop().await.is_ok());
    assert_eq!(broker.queue_len(REQUESTS), 0);
}

#[tokio::test]
async fn test_reply_to_overrides_response_queue() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(
        REQUESTS,
        IncomingMessage::new(r#"{"payload":{"voucherCode":"X1"}}"#)
            .with_correlation_id("rpc-1")
            .with_reply_to("amq.gen-reply"),
    );
    assert!(broker.wait_for_published("amq.gen-reply", 1, WAIT).await);

    let reply = &broker.published("amq.gen-reply")[0];
    assert_eq!(reply.correlation_id.as_deref(), Some("rpc-1"));
    assert_eq!(decode(reply).id.as_str(), "rpc-1");
    assert!(broker.published(RESPONSES).is_empty());

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_redelivered_request_answered_identically() {
    let broker = InMemoryBroker::new();
    let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
    let running = start(&broker, config(), forward(&upstream));

    broker.push(REQUESTS, request("twice"));
    let mut again = request("twice");
    again.redelivered = true;
    broker.push(REQUESTS, again);

    assert!(broker.wait_for_published(RESPONSES, 2, WAIT).await);
    let responses = broker.published(RESPONSES);
    assert_eq!(decode(&responses[0]), decode(&responses[1]));

    assert!(running.stop().await.is_ok());
}
