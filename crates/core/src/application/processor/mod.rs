// Request Processor
//
// Turns a decoded request into a response, calling the upstream HTTP
// service with retries. Upstream failures surface as UpstreamError and are
// converted into error responses by the message handler.

mod forward;
mod release_plan;

pub use forward::ForwardProcessor;
pub use release_plan::ReleasePlanProcessor;

use crate::application::retry::{retry, BackoffPolicy, Failure, RetryError};
use crate::domain::{CorrelationId, ErrorReason, RequestMessage, ResponseMessage};
use crate::port::{TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Longest upstream body quoted in an error detail
const MAX_DETAIL_BODY_LEN: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Transient failures outlasted the retry budget
    #[error("Upstream unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    /// Non-retryable status (4xx)
    #[error("Upstream rejected the request with status {status}")]
    Rejected { status: u16, body: Option<String> },

    #[error("Upstream response could not be interpreted: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            UpstreamError::Unavailable { .. } => ErrorReason::UpstreamUnavailable,
            UpstreamError::Rejected { .. } => ErrorReason::UpstreamRejected,
            UpstreamError::InvalidResponse(_) => ErrorReason::UpstreamInvalidResponse,
        }
    }

    /// Error response for the request `id`.
    ///
    /// Only rejections carry a `detail`, quoting the upstream status and body;
    /// the other reasons are answered bare and logged by the caller.
    pub fn into_response(self, id: CorrelationId) -> ResponseMessage {
        let detail = match &self {
            UpstreamError::Rejected {
                body: Some(body), ..
            } => Some(format!("{}: {}", self, body)),
            UpstreamError::Rejected { body: None, .. } => Some(self.to_string()),
            _ => None,
        };
        ResponseMessage::error(id, self.reason(), detail)
    }
}

/// Request processor interface
///
/// Implementations:
/// - ForwardProcessor: forwards the payload to one upstream endpoint
/// - ReleasePlanProcessor: computes a voucher release plan
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Validation failures are returned as `Ok` error responses; only
    /// upstream failures are `Err`.
    async fn process(&self, request: &RequestMessage) -> Result<ResponseMessage, UpstreamError>;
}

/// Why one upstream attempt failed
#[derive(Debug)]
enum CallFailure {
    Status(UpstreamResponse),
    Transport(TransportError),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Status(resp) => write!(f, "HTTP status {}", resp.status),
            CallFailure::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// 5xx and 429 are worth retrying
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 429
}

/// Upstream client plus its retry policy
#[derive(Clone)]
pub struct UpstreamCaller {
    client: Arc<dyn UpstreamClient>,
    policy: BackoffPolicy,
}

impl UpstreamCaller {
    pub fn new(client: Arc<dyn UpstreamClient>, policy: BackoffPolicy) -> Self {
        Self { client, policy }
    }

    /// Send `request`, retrying transient failures. Returns the 2xx response.
    pub async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let client = &self.client;
        let request = &request;

        let result = retry(&self.policy, "upstream_call", |attempt| async move {
            debug!(
                attempt,
                path = %request.path,
                correlation_id = request.correlation_id.as_deref().unwrap_or("-"),
                "Calling upstream"
            );
            match client.send(request.clone()).await {
                Ok(resp) if resp.is_success() => Ok(resp),
                Ok(resp) if is_transient_status(resp.status) => {
                    Err(Failure::Transient(CallFailure::Status(resp)))
                }
                Ok(resp) => Err(Failure::Permanent(CallFailure::Status(resp))),
                Err(e) => Err(Failure::Transient(CallFailure::Transport(e))),
            }
        })
        .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => UpstreamError::Unavailable {
                attempts,
                message: last.to_string(),
            },
            RetryError::Permanent {
                error: CallFailure::Status(resp),
                ..
            } => UpstreamError::Rejected {
                status: resp.status,
                body: quoted_body(&resp),
            },
            RetryError::Permanent {
                attempts,
                error: CallFailure::Transport(e),
            } => UpstreamError::Unavailable {
                attempts,
                message: e.to_string(),
            },
        })
    }
}

fn quoted_body(resp: &UpstreamResponse) -> Option<String> {
    let text = resp.text();
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_DETAIL_BODY_LEN).collect())
}
