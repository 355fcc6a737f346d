// Application Layer - Use Cases and Business Logic

pub mod connection_manager;
pub mod consumer;
pub mod processor;
pub mod publisher;
pub mod retry;
pub mod worker;

// Re-exports
pub use connection_manager::ConnectionManager;
pub use consumer::{Consumer, InFlightDelivery, PrefetchWindow};
pub use processor::{
    ForwardProcessor, ReleasePlanProcessor, RequestProcessor, UpstreamCaller, UpstreamError,
};
pub use publisher::Publisher;
pub use retry::{BackoffPolicy, RetryDecision, RetryState};
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, Worker, WorkerConfig};
