// Vouchers Infrastructure - RabbitMQ Adapter (lapin)
// Implements: Broker, DeliveryStream, Acknowledger

mod broker;
mod broker_url;
mod delivery;

pub use broker::AmqpBroker;
pub use broker_url::{BrokerUrl, UrlError};
