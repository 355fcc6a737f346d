// Consumer with prefetch window
//
// A permit is taken from the window before a delivery is pulled and only
// released once the delivery is acknowledged or rejected, so the number of
// unacknowledged messages never exceeds the window.

use crate::domain::IncomingMessage;
use crate::port::{AckError, Acknowledger, Broker, ConnectionError, Delivery, DeliveryStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

struct WindowInner {
    semaphore: Arc<Semaphore>,
    limit: u16,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Bound on unacknowledged deliveries, shared for the worker's lifetime
#[derive(Clone)]
pub struct PrefetchWindow {
    inner: Arc<WindowInner>,
}

impl PrefetchWindow {
    /// `limit` of 0 is raised to 1
    pub fn new(limit: u16) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(WindowInner {
                semaphore: Arc::new(Semaphore::new(usize::from(limit))),
                limit,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> u16 {
        self.inner.limit
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Wait for a free slot. `None` if the window was closed.
    pub async fn acquire(&self) -> Option<InFlightSlot> {
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned().await.ok()?;
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        Some(InFlightSlot {
            _permit: permit,
            window: Arc::clone(&self.inner),
        })
    }
}

/// One occupied slot of the prefetch window; freed on drop
pub struct InFlightSlot {
    _permit: OwnedSemaphorePermit,
    window: Arc<WindowInner>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.window.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Delivery holding a prefetch slot until it is settled.
///
/// Dropping it unsettled (an aborted handler task, for instance) requeues the
/// message.
pub struct InFlightDelivery {
    pub message: IncomingMessage,
    acker: Option<Box<dyn Acknowledger>>,
    slot: Option<InFlightSlot>,
}

impl InFlightDelivery {
    pub fn new(delivery: Delivery, slot: InFlightSlot) -> Self {
        Self {
            message: delivery.message,
            acker: Some(delivery.acker),
            slot: Some(slot),
        }
    }

    pub async fn ack(mut self) -> Result<(), AckError> {
        let result = match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        };
        self.slot.take();
        result
    }

    pub async fn reject(mut self, requeue: bool) -> Result<(), AckError> {
        let result = match self.acker.take() {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        };
        self.slot.take();
        result
    }
}

impl Drop for InFlightDelivery {
    fn drop(&mut self) {
        let Some(acker) = self.acker.take() else {
            return;
        };
        let slot = self.slot.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Delivery dropped unsettled, requeueing");
                handle.spawn(async move {
                    let _slot = slot;
                    if let Err(e) = acker.reject(true).await {
                        warn!(error = %e, "Requeue of dropped delivery failed");
                    }
                });
            }
            Err(_) => {
                warn!("Delivery dropped outside the runtime; broker redelivers on reconnect");
            }
        }
    }
}

/// Subscription on the request queue
pub struct Consumer {
    stream: Box<dyn DeliveryStream>,
    window: PrefetchWindow,
}

impl Consumer {
    /// Declare `queue` and start consuming it with the window's limit as QoS prefetch
    pub async fn subscribe(
        broker: &dyn Broker,
        queue: &str,
        window: PrefetchWindow,
    ) -> Result<Self, ConnectionError> {
        broker.declare_queue(queue).await?;
        let stream = broker.subscribe(queue, window.limit()).await?;
        info!(queue, prefetch = window.limit(), "Consumer subscribed");
        Ok(Self { stream, window })
    }

    /// Next delivery; waits for a free window slot first.
    ///
    /// `None` once the subscription ended (cancelled or closed).
    pub async fn next(&mut self) -> Option<Result<InFlightDelivery, ConnectionError>> {
        let slot = self.window.acquire().await?;
        match self.stream.next().await? {
            Ok(delivery) => Some(Ok(InFlightDelivery::new(delivery, slot))),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::broker::mocks::{BrokerEvent, InMemoryBroker};
    use std::time::Duration;

    async fn connected_broker(messages: usize) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();
        for i in 0..messages {
            broker.push("requests", IncomingMessage::new(format!(r#"{{"id":"{}"}}"#, i)));
        }
        broker
    }

    #[tokio::test]
    async fn test_window_blocks_at_limit() {
        let broker = connected_broker(3).await;
        let window = PrefetchWindow::new(2);
        let mut consumer = Consumer::subscribe(&broker, "requests", window.clone())
            .await
            .unwrap();

        let first = consumer.next().await.unwrap().unwrap();
        let _second = consumer.next().await.unwrap().unwrap();
        assert_eq!(window.in_flight(), 2);

        // Third delivery waits for a free slot
        let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let third = consumer.next().await.unwrap().unwrap();
        assert_eq!(third.message.body, br#"{"id":"2"}"#.to_vec());
        assert_eq!(window.peak(), 2);
        assert!(broker.max_unacked() <= 2);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = connected_broker(1).await;
        let window = PrefetchWindow::new(1);
        let mut consumer = Consumer::subscribe(&broker, "requests", window.clone())
            .await
            .unwrap();

        let delivery = consumer.next().await.unwrap().unwrap();
        drop(delivery);

        let redelivered = consumer.next().await.unwrap().unwrap();
        assert!(redelivered.message.redelivered);
        assert!(matches!(
            broker.events().first(),
            Some(BrokerEvent::Rejected { requeue: true, .. })
        ));
        redelivered.ack().await.unwrap();
        assert_eq!(window.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_ends_stream() {
        let broker = connected_broker(0).await;
        let mut consumer = Consumer::subscribe(&broker, "requests", PrefetchWindow::new(1))
            .await
            .unwrap();

        broker.cancel().await.unwrap();
        assert!(consumer.next().await.is_none());
    }

    #[test]
    fn test_zero_limit_is_one() {
        assert_eq!(PrefetchWindow::new(0).limit(), 1);
    }
}
