// AMQP Broker (lapin)
//
// One connection with one channel in confirm mode. Publishes go to the
// default exchange with the queue name as routing key.

use crate::delivery::{outgoing_properties, AmqpDeliveryStream};
use crate::broker_url::BrokerUrl;
use async_trait::async_trait;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vouchers_core::port::{Broker, ConnectionError, DeliveryStream, OutgoingMessage, PublishError};

const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;

struct Session {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpBroker {
    url: BrokerUrl,
    session: RwLock<Option<Session>>,
    consumer_tag: Mutex<Option<String>>,
}

impl AmqpBroker {
    pub fn new(url: BrokerUrl) -> Self {
        Self {
            url,
            session: RwLock::new(None),
            consumer_tag: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &BrokerUrl {
        &self.url
    }

    /// Declare a server-named, exclusive queue for RPC replies
    pub async fn declare_reply_queue(&self) -> Result<String, ConnectionError> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(failed)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn channel(&self) -> Result<Channel, ConnectionError> {
        let session = self.session.read().await;
        match session.as_ref() {
            Some(session) if session.channel.status().connected() => Ok(session.channel.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }
}

fn failed(e: lapin::Error) -> ConnectionError {
    ConnectionError::Failed(e.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<(), ConnectionError> {
        // A stale session from a lost connection is discarded first
        if let Some(stale) = self.session.write().await.take() {
            let _ = stale.connection.close(REPLY_SUCCESS, "reconnecting").await;
        }

        let connection = Connection::connect(self.url.address(), ConnectionProperties::default())
            .await
            .map_err(failed)?;
        let channel = connection.create_channel().await.map_err(failed)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(failed)?;

        info!(url = %self.url, "AMQP channel open (publisher confirms)");
        *self.session.write().await = Some(Session {
            connection,
            channel,
        });
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), ConnectionError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(failed)?;
        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, ConnectionError> {
        let channel = self.channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(failed)?;
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(failed)?;

        let tag = consumer.tag().as_str().to_string();
        debug!(queue, consumer_tag = %tag, prefetch, "Consuming");
        *self.consumer_tag.lock().await = Some(tag);

        Ok(Box::new(AmqpDeliveryStream::new(consumer)))
    }

    async fn cancel(&self) -> Result<(), ConnectionError> {
        let Some(tag) = self.consumer_tag.lock().await.take() else {
            return Ok(());
        };
        let channel = self.channel().await?;
        channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
            .map_err(failed)
    }

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), PublishError> {
        let channel = self
            .channel()
            .await
            .map_err(|_| PublishError::NotConnected)?;
        let properties = outgoing_properties(&message);

        let confirmation = channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| PublishError::Failed(e.to_string()))?
            .await
            .map_err(|e| PublishError::Failed(e.to_string()))?;

        if confirmation.is_nack() {
            warn!(queue, "Publish not confirmed by broker");
            return Err(PublishError::Nacked);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.consumer_tag.lock().await.take();
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        if let Err(e) = session.channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "Channel already closed");
        }
        session
            .connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> AmqpBroker {
        AmqpBroker::new("amqp://localhost".parse().unwrap())
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = broker();

        assert_eq!(
            broker.declare_queue("requests").await,
            Err(ConnectionError::NotConnected)
        );
        assert!(matches!(
            broker.subscribe("requests", 1).await,
            Err(ConnectionError::NotConnected)
        ));
        assert_eq!(
            broker.publish("responses", OutgoingMessage::new("{}")).await,
            Err(PublishError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_close_and_cancel_without_session_are_noops() {
        let broker = broker();
        assert!(broker.cancel().await.is_ok());
        assert!(broker.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on port 1
        let broker = AmqpBroker::new("amqp://127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            broker.connect().await,
            Err(ConnectionError::Failed(_))
        ));
    }
}
