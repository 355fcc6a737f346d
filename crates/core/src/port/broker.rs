// Broker Port (Interface)
// One connection, one channel: implementations hold the only socket to the broker

use crate::domain::IncomingMessage;
use async_trait::async_trait;
use thiserror::Error;

/// Connection-level errors (transient, retried with backoff)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Gave up connecting after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Invalid connection state: {0}")]
    InvalidState(String),
}

/// Publish errors; the originating request stays unacknowledged
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker did not confirm the message")]
    Nacked,

    #[error("Publish failed: {0}")]
    Failed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("Acknowledgement failed: {0}")]
    Failed(String),
}

/// Message to publish on the default exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Settles one delivery. Exactly one of `ack`/`reject` is called per delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AckError>;

    /// Negative acknowledgement; `requeue` puts the message back on its queue
    async fn reject(&self, requeue: bool) -> Result<(), AckError>;
}

/// A received message plus its acknowledgement handle
pub struct Delivery {
    pub message: IncomingMessage,
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Lazy, infinite sequence of deliveries for one subscription
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery. `None` once the subscription is cancelled or the connection closed,
    /// `Some(Err(_))` when the connection was lost.
    async fn next(&mut self) -> Option<Result<Delivery, ConnectionError>>;
}

/// Broker interface
///
/// Implementations:
/// - AmqpBroker: RabbitMQ over lapin
/// - mocks::InMemoryBroker: queues in memory (tests)
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open the connection and channel (single attempt)
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Declare a durable queue
    async fn declare_queue(&self, queue: &str) -> Result<(), ConnectionError>;

    /// Start consuming `queue` with the given QoS prefetch
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, ConnectionError>;

    /// Stop the active subscription; the broker stops delivering new messages
    async fn cancel(&self) -> Result<(), ConnectionError>;

    /// Publish a persistent message and wait for the broker's confirmation
    async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), PublishError>;

    /// Close channel and connection; unacknowledged messages return to their queues
    async fn close(&self) -> Result<(), ConnectionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Observable broker-side effects, in the order they happened
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BrokerEvent {
        Published {
            queue: String,
            correlation_id: Option<String>,
        },
        Acked {
            correlation_id: Option<String>,
        },
        Rejected {
            correlation_id: Option<String>,
            requeue: bool,
        },
    }

    #[derive(Default)]
    struct State {
        connected: bool,
        closed: bool,
        session: u64,
        connect_calls: u32,
        connect_failures_remaining: u32,
        publish_failures_remaining: u32,
        queues: HashMap<String, VecDeque<IncomingMessage>>,
        published: Vec<(String, OutgoingMessage)>,
        events: Vec<BrokerEvent>,
        subscription: Option<String>,
        unacked: HashMap<u64, (String, IncomingMessage)>,
        next_tag: u64,
        max_unacked: usize,
    }

    impl State {
        fn requeue_unacked(&mut self) {
            let mut pending: Vec<_> = self.unacked.drain().collect();
            pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, (queue, message)) in pending {
                self.queues
                    .entry(queue)
                    .or_default()
                    .push_front(redelivered(message));
            }
        }
    }

    fn redelivered(mut message: IncomingMessage) -> IncomingMessage {
        message.redelivered = true;
        message.delivery_count = Some(message.delivery_count.unwrap_or(0) + 1);
        message
    }

    fn label(message: &IncomingMessage) -> Option<String> {
        message
            .decode()
            .ok()
            .map(|req| req.correlation_id.to_string())
            .or_else(|| message.correlation_id.clone())
    }

    struct Shared {
        state: Mutex<State>,
        notify: Notify,
    }

    impl Shared {
        fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
            let mut state = self.state.lock().unwrap();
            f(&mut state)
        }
    }

    /// In-memory broker with scripted failures
    #[derive(Clone)]
    pub struct InMemoryBroker {
        shared: Arc<Shared>,
    }

    impl Default for InMemoryBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self {
                shared: Arc::new(Shared {
                    state: Mutex::new(State::default()),
                    notify: Notify::new(),
                }),
            }
        }

        /// Enqueue a message as an external producer would
        pub fn push(&self, queue: &str, message: IncomingMessage) {
            self.shared.with_state(|s| {
                s.queues.entry(queue.to_string()).or_default().push_back(message)
            });
            self.shared.notify.notify_waiters();
        }

        pub fn fail_next_connects(&self, n: u32) {
            self.shared.with_state(|s| s.connect_failures_remaining = n);
        }

        pub fn fail_next_publishes(&self, n: u32) {
            self.shared.with_state(|s| s.publish_failures_remaining = n);
        }

        /// Drop the connection: streams fail, unacked messages are requeued
        pub fn disconnect(&self) {
            self.shared.with_state(|s| {
                s.connected = false;
                s.session += 1;
                s.subscription = None;
                s.requeue_unacked();
            });
            self.shared.notify.notify_waiters();
        }

        pub fn published(&self, queue: &str) -> Vec<OutgoingMessage> {
            self.shared.with_state(|s| {
                s.published
                    .iter()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
        }

        pub fn events(&self) -> Vec<BrokerEvent> {
            self.shared.with_state(|s| s.events.clone())
        }

        pub fn queue_len(&self, queue: &str) -> usize {
            self.shared
                .with_state(|s| s.queues.get(queue).map(|q| q.len()).unwrap_or(0))
        }

        pub fn unacked_count(&self) -> usize {
            self.shared.with_state(|s| s.unacked.len())
        }

        /// Highest number of simultaneously unacknowledged deliveries seen
        pub fn max_unacked(&self) -> usize {
            self.shared.with_state(|s| s.max_unacked)
        }

        pub fn connect_calls(&self) -> u32 {
            self.shared.with_state(|s| s.connect_calls)
        }

        pub fn is_connected(&self) -> bool {
            self.shared.with_state(|s| s.connected)
        }

        pub fn is_closed(&self) -> bool {
            self.shared.with_state(|s| s.closed)
        }

        /// Poll until `queue` received at least `count` messages
        pub async fn wait_for_published(&self, queue: &str, count: usize, timeout: Duration) -> bool {
            self.wait_until(timeout, |b| b.published(queue).len() >= count)
                .await
        }

        /// Poll until `predicate` holds or `timeout` passes
        pub async fn wait_until(
            &self,
            timeout: Duration,
            predicate: impl Fn(&InMemoryBroker) -> bool,
        ) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if predicate(self) {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[async_trait]
    impl Broker for InMemoryBroker {
        async fn connect(&self) -> Result<(), ConnectionError> {
            self.shared.with_state(|s| {
                s.connect_calls += 1;
                if s.connect_failures_remaining > 0 {
                    s.connect_failures_remaining -= 1;
                    return Err(ConnectionError::Failed("connection refused".to_string()));
                }
                s.connected = true;
                s.closed = false;
                Ok(())
            })
        }

        async fn declare_queue(&self, queue: &str) -> Result<(), ConnectionError> {
            self.shared.with_state(|s| {
                if !s.connected {
                    return Err(ConnectionError::NotConnected);
                }
                s.queues.entry(queue.to_string()).or_default();
                Ok(())
            })
        }

        async fn subscribe(
            &self,
            queue: &str,
            _prefetch: u16,
        ) -> Result<Box<dyn DeliveryStream>, ConnectionError> {
            let session = self.shared.with_state(|s| {
                if !s.connected {
                    return Err(ConnectionError::NotConnected);
                }
                s.subscription = Some(queue.to_string());
                Ok(s.session)
            })?;
            Ok(Box::new(MemoryStream {
                shared: Arc::clone(&self.shared),
                queue: queue.to_string(),
                session,
                failed: false,
            }))
        }

        async fn cancel(&self) -> Result<(), ConnectionError> {
            self.shared.with_state(|s| s.subscription = None);
            self.shared.notify.notify_waiters();
            Ok(())
        }

        async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), PublishError> {
            self.shared.with_state(|s| {
                if !s.connected {
                    return Err(PublishError::NotConnected);
                }
                if s.publish_failures_remaining > 0 {
                    s.publish_failures_remaining -= 1;
                    return Err(PublishError::Failed("channel error".to_string()));
                }
                s.events.push(BrokerEvent::Published {
                    queue: queue.to_string(),
                    correlation_id: message.correlation_id.clone(),
                });
                s.published.push((queue.to_string(), message));
                Ok(())
            })
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            self.shared.with_state(|s| {
                s.connected = false;
                s.closed = true;
                s.session += 1;
                s.subscription = None;
                s.requeue_unacked();
            });
            self.shared.notify.notify_waiters();
            Ok(())
        }
    }

    struct MemoryStream {
        shared: Arc<Shared>,
        queue: String,
        session: u64,
        failed: bool,
    }

    #[async_trait]
    impl DeliveryStream for MemoryStream {
        async fn next(&mut self) -> Option<Result<Delivery, ConnectionError>> {
            loop {
                let notified = self.shared.notify.notified();
                let polled = self.shared.with_state(|s| {
                    if s.closed {
                        return Some(None);
                    }
                    if s.session != self.session {
                        if self.failed {
                            return Some(None);
                        }
                        self.failed = true;
                        return Some(Some(Err(ConnectionError::Failed(
                            "connection lost".to_string(),
                        ))));
                    }
                    if s.subscription.as_deref() != Some(self.queue.as_str()) {
                        return Some(None);
                    }
                    let message = s.queues.get_mut(&self.queue)?.pop_front()?;
                    let tag = s.next_tag;
                    s.next_tag += 1;
                    s.unacked.insert(tag, (self.queue.clone(), message.clone()));
                    s.max_unacked = s.max_unacked.max(s.unacked.len());
                    let acker = MemoryAcker {
                        shared: Arc::clone(&self.shared),
                        tag,
                        session: self.session,
                    };
                    Some(Some(Ok(Delivery {
                        message,
                        acker: Box::new(acker),
                    })))
                });
                if let Some(result) = polled {
                    return result;
                }
                notified.await;
            }
        }
    }

    struct MemoryAcker {
        shared: Arc<Shared>,
        tag: u64,
        session: u64,
    }

    impl MemoryAcker {
        fn settle(&self, requeue: Option<bool>) -> Result<(), AckError> {
            let settled = self.shared.with_state(|s| {
                if s.session != self.session {
                    return Err(AckError::Failed("channel closed".to_string()));
                }
                let (queue, message) = s
                    .unacked
                    .remove(&self.tag)
                    .ok_or_else(|| AckError::Failed("unknown delivery tag".to_string()))?;
                let correlation_id = label(&message);
                match requeue {
                    None => s.events.push(BrokerEvent::Acked { correlation_id }),
                    Some(requeue) => {
                        s.events.push(BrokerEvent::Rejected {
                            correlation_id,
                            requeue,
                        });
                        if requeue {
                            s.queues
                                .entry(queue)
                                .or_default()
                                .push_front(redelivered(message));
                        }
                    }
                }
                Ok(())
            });
            self.shared.notify.notify_waiters();
            settled
        }
    }

    #[async_trait]
    impl Acknowledger for MemoryAcker {
        async fn ack(&self) -> Result<(), AckError> {
            self.settle(None)
        }

        async fn reject(&self, requeue: bool) -> Result<(), AckError> {
            self.settle(Some(requeue))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::{BrokerEvent, InMemoryBroker};
    use super::*;

    #[test]
    fn test_outgoing_message_headers() {
        let msg = OutgoingMessage::new("{}")
            .with_correlation_id("abc")
            .with_header("x-dead-letter-reason", "invalid_json");
        assert_eq!(msg.header("x-dead-letter-reason"), Some("invalid_json"));
        assert_eq!(msg.header("missing"), None);
    }

    #[tokio::test]
    async fn test_memory_broker_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();
        broker.push("requests", IncomingMessage::new(r#"{"id":"a"}"#));

        let mut stream = broker.subscribe("requests", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.message.redelivered);
        first.acker.reject(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.message.redelivered);
        assert_eq!(second.message.delivery_count, Some(1));
        second.acker.ack().await.unwrap();

        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(
            broker.events(),
            vec![
                BrokerEvent::Rejected {
                    correlation_id: Some("a".to_string()),
                    requeue: true
                },
                BrokerEvent::Acked {
                    correlation_id: Some("a".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_broker_disconnect_fails_stream() {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();
        broker.push("requests", IncomingMessage::new(r#"{"id":"a"}"#));

        let mut stream = broker.subscribe("requests", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.disconnect();

        assert!(matches!(stream.next().await, Some(Err(_))));
        assert!(stream.next().await.is_none());
        assert!(delivery.acker.ack().await.is_err());
        assert_eq!(broker.queue_len("requests"), 1);
        assert_eq!(
            broker.publish("responses", OutgoingMessage::new("{}")).await,
            Err(PublishError::NotConnected)
        );
    }
}
