// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod upstream;

// Re-exports
pub use broker::{
    AckError, Acknowledger, Broker, ConnectionError, Delivery, DeliveryStream, OutgoingMessage,
    PublishError,
};
pub use upstream::{HttpMethod, TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse};
