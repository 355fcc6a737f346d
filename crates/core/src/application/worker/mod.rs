// Worker - Consume loop with bounded concurrency and graceful drain

pub mod constants;
mod handler;
mod redelivery;
mod shutdown;

use constants::*;
pub use handler::{MessageHandler, PROCESSING_PANICKED_REASON, PUBLISH_FAILED_REASON};
pub use redelivery::RedeliveryTracker;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::connection_manager::ConnectionManager;
use crate::application::consumer::{Consumer, PrefetchWindow};
use crate::application::processor::RequestProcessor;
use crate::application::publisher::Publisher;
use crate::port::ConnectionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Queue names and limits of one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub request_queue: String,
    pub response_queue: String,
    pub dead_letter_queue: String,
    pub prefetch: u16,
    pub max_delivery_attempts: u32,
    pub drain_timeout: Duration,
}

impl WorkerConfig {
    /// Defaults: prefetch 1, dead-letter queue `<request>.dlq`, 3 delivery attempts
    pub fn new(request_queue: impl Into<String>, response_queue: impl Into<String>) -> Self {
        let request_queue = request_queue.into();
        Self {
            dead_letter_queue: format!("{}{}", request_queue, DEAD_LETTER_QUEUE_SUFFIX),
            request_queue,
            response_queue: response_queue.into(),
            prefetch: DEFAULT_PREFETCH,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = queue.into();
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Why the consume loop stopped
enum ConsumeEnd {
    Shutdown,
    Disconnected,
}

/// Worker consumes the request queue and answers every request
pub struct Worker {
    config: WorkerConfig,
    connection: Arc<ConnectionManager>,
    handler: Arc<MessageHandler>,
    window: PrefetchWindow,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        connection: Arc<ConnectionManager>,
        processor: Arc<dyn RequestProcessor>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(
            connection.broker(),
            connection.watch_state(),
            config.response_queue.clone(),
            config.dead_letter_queue.clone(),
            config.request_queue.clone(),
        ));
        let handler = Arc::new(MessageHandler::new(
            processor,
            publisher,
            Arc::new(RedeliveryTracker::new(REDELIVERY_TRACKER_CAPACITY)),
            config.max_delivery_attempts,
        ));
        let window = PrefetchWindow::new(config.prefetch);

        Self {
            config,
            connection,
            handler,
            window,
        }
    }

    /// Prefetch window shared by every subscription of this worker
    pub fn window(&self) -> &PrefetchWindow {
        &self.window
    }

    /// Run until shutdown or an unrecoverable connection failure.
    ///
    /// Lost connections are re-established with the connection manager's
    /// retry policy; exhausting it returns the error. In both cases in-flight
    /// messages are drained before the connection is closed.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<(), ConnectionError> {
        info!(
            queue = %self.config.request_queue,
            prefetch = self.window.limit(),
            "Worker started"
        );
        let mut tasks = JoinSet::new();
        let mut subscribe_failures: u32 = 0;

        let result = loop {
            if shutdown.is_shutdown() {
                break Ok(());
            }

            let connected = tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                connected = self.connection.connect() => connected,
            };
            if let Err(e) = connected {
                error!(error = %e, class = "connection", "Giving up on broker connection");
                break Err(e);
            }

            let mut consumer = match self.subscribe().await {
                Ok(consumer) => {
                    subscribe_failures = 0;
                    consumer
                }
                Err(e) => {
                    subscribe_failures += 1;
                    if subscribe_failures >= self.connection.policy().attempts() {
                        error!(error = %e, attempts = subscribe_failures, "Giving up on subscription");
                        break Err(e);
                    }
                    warn!(error = %e, attempts = subscribe_failures, "Subscribe failed, reconnecting");
                    self.connection.mark_disconnected();
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break Ok(()),
                    }
                    continue;
                }
            };

            match self.consume(&mut consumer, &mut shutdown, &mut tasks).await {
                ConsumeEnd::Shutdown => break Ok(()),
                ConsumeEnd::Disconnected => self.connection.mark_disconnected(),
            }
        };

        self.drain(tasks).await;
        info!(queue = %self.config.request_queue, "Worker stopped");
        result
    }

    /// Declare the output queues, then consume the request queue
    async fn subscribe(&self) -> Result<Consumer, ConnectionError> {
        let broker = self.connection.broker();
        broker.declare_queue(&self.config.response_queue).await?;
        broker.declare_queue(&self.config.dead_letter_queue).await?;
        Consumer::subscribe(broker.as_ref(), &self.config.request_queue, self.window.clone()).await
    }

    async fn consume(
        &self,
        consumer: &mut Consumer,
        shutdown: &mut ShutdownToken,
        tasks: &mut JoinSet<()>,
    ) -> ConsumeEnd {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return ConsumeEnd::Shutdown,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_task_result(joined),
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let handler = Arc::clone(&self.handler);
                        // Aborted tasks drop their delivery, which requeues it
                        tasks.spawn(async move { handler.handle(delivery).await });
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Delivery stream failed");
                        return ConsumeEnd::Disconnected;
                    }
                    None => {
                        warn!("Subscription ended by the broker");
                        return ConsumeEnd::Disconnected;
                    }
                },
            }
        }
    }

    /// Cancel the consumer, let in-flight messages finish, close the connection
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if let Err(e) = self.connection.drain().await {
            warn!(error = %e, "Cancelling consumer failed");
        }

        if !tasks.is_empty() {
            info!(
                in_flight = tasks.len(),
                timeout_secs = self.config.drain_timeout.as_secs(),
                "Waiting for in-flight messages"
            );
        }
        let drained = tokio::time::timeout(self.config.drain_timeout, join_all(&mut tasks)).await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Drain timeout elapsed, abandoning in-flight messages"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Closing broker connection failed");
        }
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_task_result(joined);
    }
}

fn log_task_result(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Message task panicked"),
        Err(e) => warn!(error = %e, "Message task cancelled"),
    }
}
