// Central Error Type for the Application

use thiserror::Error;

/// Every failure class the worker distinguishes
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Connection error: {0}")]
    Connection(#[from] crate::port::ConnectionError),

    #[error("Publish error: {0}")]
    Publish(#[from] crate::port::PublishError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::application::processor::UpstreamError),

    #[error("Decode error: {0}")]
    Decode(#[from] crate::domain::DecodeError),
}

impl AppError {
    /// Short error class name used in log fields
    pub fn class(&self) -> &'static str {
        match self {
            AppError::Domain(_) => "domain",
            AppError::Connection(_) => "connection",
            AppError::Publish(_) => "publish",
            AppError::Upstream(_) => "upstream",
            AppError::Decode(_) => "decode",
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DecodeError;
    use crate::port::{ConnectionError, PublishError};

    #[test]
    fn test_error_class() {
        let err = AppError::from(ConnectionError::Exhausted {
            attempts: 5,
            last_error: "connection refused".to_string(),
        });
        assert_eq!(err.class(), "connection");
        assert!(err.to_string().contains("after 5 attempts"));

        let err = AppError::from(PublishError::Nacked);
        assert_eq!(err.class(), "publish");

        assert_eq!(AppError::from(DecodeError::NotAnObject).class(), "decode");
    }
}
