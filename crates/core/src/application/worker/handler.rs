// Message handler: decode -> process -> publish -> acknowledge
//
// A delivery is acknowledged only after its response (or dead letter) was
// confirmed by the broker. Publish failures and processor panics requeue the
// delivery until `max_delivery_attempts` is reached, then it is dead-lettered.

use super::redelivery::RedeliveryTracker;
use crate::application::consumer::InFlightDelivery;
use crate::application::processor::RequestProcessor;
use crate::application::publisher::Publisher;
use crate::domain::{CorrelationId, DecodeError};
use crate::port::AckError;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Dead-letter reason once publishing kept failing
pub const PUBLISH_FAILED_REASON: &str = "publish_failed";

/// Dead-letter reason once the processor kept panicking on a message
pub const PROCESSING_PANICKED_REASON: &str = "processing_panicked";

pub struct MessageHandler {
    processor: Arc<dyn RequestProcessor>,
    publisher: Arc<Publisher>,
    tracker: Arc<RedeliveryTracker>,
    max_delivery_attempts: u32,
}

impl MessageHandler {
    pub fn new(
        processor: Arc<dyn RequestProcessor>,
        publisher: Arc<Publisher>,
        tracker: Arc<RedeliveryTracker>,
        max_delivery_attempts: u32,
    ) -> Self {
        Self {
            processor,
            publisher,
            tracker,
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    /// Handle one delivery to completion. Never fails: every outcome ends in
    /// an ack or a reject.
    pub async fn handle(&self, delivery: InFlightDelivery) {
        let request = match delivery.message.decode() {
            Ok(request) => request,
            Err(e) => return self.dead_letter_undecodable(delivery, e).await,
        };
        let correlation_id = request.correlation_id.clone();
        debug!(
            correlation_id = %correlation_id,
            redelivered = delivery.message.redelivered,
            "Processing request"
        );

        let processed = AssertUnwindSafe(self.processor.process(&request))
            .catch_unwind()
            .await;
        let response = match processed {
            Ok(Ok(response)) => response,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(correlation_id = %correlation_id, panic_msg = %message, "Processor panicked");
                return self
                    .retry_or_dead_letter(delivery, &correlation_id, PROCESSING_PANICKED_REASON, message)
                    .await;
            }
            Ok(Err(e)) => {
                warn!(
                    correlation_id = %correlation_id,
                    reason = %e.reason(),
                    error = %e,
                    "Upstream call failed"
                );
                e.into_response(correlation_id.clone())
            }
        };

        match self.publisher.respond(&request, &response).await {
            Ok(()) => {
                self.tracker.forget(&correlation_id);
                log_settle(&correlation_id, "ack", delivery.ack().await);
                info!(
                    correlation_id = %correlation_id,
                    ok = response.is_ok(),
                    "Request handled"
                );
            }
            Err(e) => {
                self.retry_or_dead_letter(delivery, &correlation_id, PUBLISH_FAILED_REASON, e)
                    .await
            }
        }
    }

    async fn dead_letter_undecodable(&self, delivery: InFlightDelivery, error: DecodeError) {
        warn!(error = %error, "Undecodable request");
        match self.publisher.dead_letter(&delivery.message, error.reason()).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "Ack of dead-lettered message failed");
                }
            }
            Err(e) => {
                error!(error = %e, "Dead-lettering failed, requeueing");
                if let Err(e) = delivery.reject(true).await {
                    warn!(error = %e, "Requeue failed");
                }
            }
        }
    }

    /// Requeue after a failed attempt; dead-letter with `reason` once the
    /// attempts are used up
    async fn retry_or_dead_letter(
        &self,
        delivery: InFlightDelivery,
        correlation_id: &CorrelationId,
        reason: &'static str,
        error: impl fmt::Display,
    ) {
        let attempts = self
            .tracker
            .record_failure(correlation_id, delivery.message.delivery_count);

        if attempts < self.max_delivery_attempts {
            warn!(
                correlation_id = %correlation_id,
                attempts,
                max_attempts = self.max_delivery_attempts,
                reason,
                error = %error,
                "Attempt failed, requeueing"
            );
            log_settle(correlation_id, "requeue", delivery.reject(true).await);
            return;
        }

        error!(
            correlation_id = %correlation_id,
            attempts,
            reason,
            error = %error,
            "Attempts exhausted, dead-lettering"
        );
        match self.publisher.dead_letter(&delivery.message, reason).await {
            Ok(()) => {
                self.tracker.forget(correlation_id);
                log_settle(correlation_id, "ack", delivery.ack().await);
            }
            Err(e) => {
                error!(correlation_id = %correlation_id, error = %e, "Dead-lettering failed, requeueing");
                log_settle(correlation_id, "requeue", delivery.reject(true).await);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn log_settle(correlation_id: &CorrelationId, action: &str, result: Result<(), AckError>) {
    if let Err(e) = result {
        // Broker redelivers unsettled messages once the channel is gone
        warn!(correlation_id = %correlation_id, action, error = %e, "Settling delivery failed");
    }
}
