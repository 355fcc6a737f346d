// lapin delivery adapters

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use vouchers_core::domain::IncomingMessage;
use vouchers_core::port::{AckError, Acknowledger, ConnectionError, Delivery, DeliveryStream, OutgoingMessage};

/// Header some brokers (quorum queues) set to the number of previous deliveries
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;

pub(crate) struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
}

impl AmqpDeliveryStream {
    pub(crate) fn new(consumer: lapin::Consumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, ConnectionError>> {
        match self.consumer.next().await? {
            Ok(delivery) => {
                let message = incoming_message(&delivery.properties, delivery.data, delivery.redelivered);
                Some(Ok(Delivery {
                    message,
                    acker: Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                }))
            }
            Err(e) => Some(Err(ConnectionError::Failed(e.to_string()))),
        }
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), AckError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| AckError::Failed(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AckError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| AckError::Failed(e.to_string()))
    }
}

pub(crate) fn incoming_message(
    properties: &BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
) -> IncomingMessage {
    IncomingMessage {
        body,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|q| q.as_str().to_string()),
        redelivered,
        delivery_count: properties.headers().as_ref().and_then(delivery_count),
    }
}

fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let value = headers.inner().get(&ShortString::from(DELIVERY_COUNT_HEADER))?;
    let count: i64 = match value {
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::LongLongInt(n) => *n,
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Persistent JSON message properties
pub(crate) fn outgoing_properties(message: &OutgoingMessage) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

    if let Some(id) = &message.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if !message.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &message.headers {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        properties = properties.with_headers(headers);
    }
    properties
}
