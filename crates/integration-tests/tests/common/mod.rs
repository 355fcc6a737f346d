//! Shared harness: a worker wired to the in-memory broker and a scripted upstream

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use vouchers_core::application::{
    shutdown_channel, BackoffPolicy, ConnectionManager, RequestProcessor, ShutdownSender, Worker,
    WorkerConfig,
};
use vouchers_core::domain::ResponseMessage;
use vouchers_core::port::broker::mocks::InMemoryBroker;
use vouchers_core::port::{ConnectionError, OutgoingMessage};

pub const REQUESTS: &str = "request_queue";
pub const RESPONSES: &str = "response_queue";
pub const DEAD_LETTERS: &str = "request_queue.dlq";

pub const WAIT: Duration = Duration::from_secs(3);

pub struct RunningWorker {
    pub broker: InMemoryBroker,
    pub worker: Arc<Worker>,
    shutdown: ShutdownSender,
    handle: JoinHandle<Result<(), ConnectionError>>,
}

impl RunningWorker {
    /// Signal shutdown and wait for `run` to return
    pub async fn stop(self) -> Result<(), ConnectionError> {
        self.shutdown.shutdown();
        self.join().await
    }

    /// Wait for `run` to return on its own
    pub async fn join(self) -> Result<(), ConnectionError> {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked")
    }
}

pub fn config() -> WorkerConfig {
    WorkerConfig::new(REQUESTS, RESPONSES).with_drain_timeout(Duration::from_secs(5))
}

/// Fast retries: connection attempts are not what these tests measure
pub fn connect_policy() -> BackoffPolicy {
    BackoffPolicy::fixed(3, Duration::from_millis(5))
}

pub fn upstream_policy() -> BackoffPolicy {
    BackoffPolicy::exponential(3, Duration::from_millis(2), 2.0)
}

pub fn start(
    broker: &InMemoryBroker,
    config: WorkerConfig,
    processor: Arc<dyn RequestProcessor>,
) -> RunningWorker {
    let connection = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        connect_policy(),
    ));
    let worker = Arc::new(Worker::new(config, connection, processor));
    let (shutdown, token) = shutdown_channel();
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run(token).await }
    });
    RunningWorker {
        broker: broker.clone(),
        worker,
        shutdown,
        handle,
    }
}

pub fn decode(message: &OutgoingMessage) -> ResponseMessage {
    ResponseMessage::from_bytes(&message.body).expect("response is not a ResponseMessage")
}

pub fn body_json(message: &OutgoingMessage) -> Value {
    serde_json::from_slice(&message.body).expect("body is not JSON")
}
