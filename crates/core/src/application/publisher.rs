// Publisher (confirmed publishes of responses and dead letters)

use crate::application::worker::constants::{DEAD_LETTER_REASON_HEADER, ORIGINAL_QUEUE_HEADER};
use crate::domain::{ConnectionState, IncomingMessage, RequestMessage, ResponseMessage};
use crate::port::{Broker, OutgoingMessage, PublishError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Publisher {
    broker: Arc<dyn Broker>,
    state: watch::Receiver<ConnectionState>,
    response_queue: String,
    dead_letter_queue: String,
    source_queue: String,
}

impl Publisher {
    /// # Arguments
    /// * `broker` - Broker adapter shared with the connection manager
    /// * `state` - Connection state watch; publishing requires a usable connection
    /// * `response_queue` - Target when a request carries no `reply_to`
    /// * `dead_letter_queue` - Target of `dead_letter`
    /// * `source_queue` - Request queue, recorded in `x-original-queue`
    pub fn new(
        broker: Arc<dyn Broker>,
        state: watch::Receiver<ConnectionState>,
        response_queue: impl Into<String>,
        dead_letter_queue: impl Into<String>,
        source_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            state,
            response_queue: response_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            source_queue: source_queue.into(),
        }
    }

    /// Publish a response and wait for the broker's confirmation
    pub async fn publish(&self, queue: &str, response: &ResponseMessage) -> Result<(), PublishError> {
        self.ensure_usable()?;
        let body = response
            .to_bytes()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        let message = OutgoingMessage::new(body).with_correlation_id(response.id.as_str());
        self.broker.publish(queue, message).await
    }

    /// Publish `response` to the request's reply-to queue, or the response queue
    pub async fn respond(
        &self,
        request: &RequestMessage,
        response: &ResponseMessage,
    ) -> Result<(), PublishError> {
        let queue = request.reply_to.as_deref().unwrap_or(&self.response_queue);
        self.publish(queue, response).await?;
        debug!(
            correlation_id = %response.id,
            queue,
            ok = response.is_ok(),
            "Response published"
        );
        Ok(())
    }

    /// Republish the raw message to the dead-letter queue
    pub async fn dead_letter(&self, message: &IncomingMessage, reason: &str) -> Result<(), PublishError> {
        self.ensure_usable()?;
        let mut outgoing = OutgoingMessage::new(message.body.clone())
            .with_header(DEAD_LETTER_REASON_HEADER, reason)
            .with_header(ORIGINAL_QUEUE_HEADER, self.source_queue.as_str());
        outgoing.correlation_id = message.correlation_id.clone();
        outgoing.reply_to = message.reply_to.clone();

        self.broker.publish(&self.dead_letter_queue, outgoing).await?;
        warn!(
            queue = %self.dead_letter_queue,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }

    fn ensure_usable(&self) -> Result<(), PublishError> {
        if self.state.borrow().is_usable() {
            Ok(())
        } else {
            Err(PublishError::NotConnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::connection_manager::ConnectionManager;
    use crate::application::retry::BackoffPolicy;
    use crate::domain::{CorrelationId, ErrorReason};
    use crate::port::broker::mocks::InMemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (InMemoryBroker, ConnectionManager, Publisher) {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            BackoffPolicy::fixed(1, Duration::ZERO),
        );
        let publisher = Publisher::new(
            manager.broker(),
            manager.watch_state(),
            "responses",
            "requests.dlq",
            "requests",
        );
        manager.connect().await.unwrap();
        (broker, manager, publisher)
    }

    fn request(reply_to: Option<&str>) -> RequestMessage {
        RequestMessage {
            correlation_id: CorrelationId::new("abc123"),
            payload: json!({}),
            reply_to: reply_to.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_respond_to_response_queue() {
        let (broker, _manager, publisher) = setup().await;
        let response = ResponseMessage::ok(CorrelationId::new("abc123"), json!({"valid": true}));

        publisher.respond(&request(None), &response).await.unwrap();

        let published = broker.published("responses");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].correlation_id.as_deref(), Some("abc123"));
        assert_eq!(
            ResponseMessage::from_bytes(&published[0].body).unwrap(),
            response
        );
    }

    #[tokio::test]
    async fn test_respond_prefers_reply_to() {
        let (broker, _manager, publisher) = setup().await;
        let response = ResponseMessage::error(
            CorrelationId::new("abc123"),
            ErrorReason::UpstreamRejected,
            None,
        );

        publisher
            .respond(&request(Some("amq.gen-xyz")), &response)
            .await
            .unwrap();

        assert_eq!(broker.published("amq.gen-xyz").len(), 1);
        assert!(broker.published("responses").is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_headers() {
        let (broker, _manager, publisher) = setup().await;
        let raw = IncomingMessage::new("not json").with_correlation_id("c-1");

        publisher.dead_letter(&raw, "invalid_json").await.unwrap();

        let dlq = broker.published("requests.dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].body, b"not json".to_vec());
        assert_eq!(dlq[0].correlation_id.as_deref(), Some("c-1"));
        assert_eq!(dlq[0].header(DEAD_LETTER_REASON_HEADER), Some("invalid_json"));
        assert_eq!(dlq[0].header(ORIGINAL_QUEUE_HEADER), Some("requests"));
    }

    #[tokio::test]
    async fn test_publish_refused_when_disconnected() {
        let (broker, manager, publisher) = setup().await;
        manager.mark_disconnected();
        let response = ResponseMessage::ok(CorrelationId::new("abc123"), json!(null));

        let err = publisher.publish("responses", &response).await.unwrap_err();
        assert_eq!(err, PublishError::NotConnected);
        assert!(broker.published("responses").is_empty());
    }
}
