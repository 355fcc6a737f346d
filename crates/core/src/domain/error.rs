// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Request body could not be turned into a RequestMessage.
/// Such messages are dead-lettered, never answered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Body is not a JSON object")]
    NotAnObject,

    #[error("No correlation id in message properties or body")]
    MissingCorrelationId,
}

impl DecodeError {
    /// Value of the `x-dead-letter-reason` header
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::NotAnObject => "not_an_object",
            DecodeError::MissingCorrelationId => "missing_correlation_id",
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
