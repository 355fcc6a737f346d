// Domain Layer - Pure business logic and entities

pub mod connection;
pub mod error;
pub mod message;
pub mod release_plan;

// Re-exports
pub use connection::ConnectionState;
pub use error::{DecodeError, DomainError};
pub use message::{CorrelationId, ErrorReason, IncomingMessage, Outcome, RequestMessage, ResponseMessage};
pub use release_plan::{ArrivalDay, DateRange, PlanType, Reduction, ReleasePlan, ReleasePlanRequest};
