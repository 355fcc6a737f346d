// Message Domain Model (request/response wire format)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::DecodeError;

/// Correlation id: opaque caller-assigned token, echoed verbatim in the response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message as handed over by the broker, before decoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    /// `correlation_id` message property
    pub correlation_id: Option<String>,
    /// `reply_to` message property
    pub reply_to: Option<String>,
    pub redelivered: bool,
    /// Broker-side count of previous deliveries (`x-delivery-count`), if the queue tracks it
    pub delivery_count: Option<u32>,
}

impl IncomingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Decode the body into a request.
    ///
    /// The correlation id comes from the message property when set, otherwise
    /// from the body's `id` field (string or integer). The payload is the
    /// body's `payload` field when present, otherwise the whole body.
    pub fn decode(&self) -> Result<RequestMessage, DecodeError> {
        let body: Value = serde_json::from_slice(&self.body)
            .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

        let Value::Object(mut fields) = body else {
            return Err(DecodeError::NotAnObject);
        };

        let correlation_id = self
            .correlation_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(CorrelationId::new)
            .or_else(|| fields.get("id").and_then(id_from_value))
            .ok_or(DecodeError::MissingCorrelationId)?;

        let payload = match fields.remove("payload") {
            Some(payload) => payload,
            None => Value::Object(fields),
        };

        Ok(RequestMessage {
            correlation_id,
            payload,
            reply_to: self.reply_to.clone().filter(|q| !q.is_empty()),
        })
    }
}

fn id_from_value(value: &Value) -> Option<CorrelationId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(CorrelationId::new(s.clone())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(CorrelationId::new(n.to_string())),
        _ => None,
    }
}

/// Decoded request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub correlation_id: CorrelationId,
    pub payload: Value,
    pub reply_to: Option<String>,
}

/// Machine-readable error reason carried by error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Transient upstream failures outlasted the retry budget
    UpstreamUnavailable,
    /// Upstream answered with a 4xx status
    UpstreamRejected,
    /// Upstream answered 2xx with a body that could not be interpreted
    UpstreamInvalidResponse,
    /// Envelope decoded but the payload failed domain validation
    InvalidRequest,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::UpstreamUnavailable => "upstream_unavailable",
            ErrorReason::UpstreamRejected => "upstream_rejected",
            ErrorReason::UpstreamInvalidResponse => "upstream_invalid_response",
            ErrorReason::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        result: Value,
    },
    Error {
        reason: ErrorReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// Response published for every decodable request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: CorrelationId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResponseMessage {
    pub fn ok(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Ok { result },
        }
    }

    pub fn error(id: CorrelationId, reason: ErrorReason, detail: Option<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error { reason, detail },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok { .. })
    }

    pub fn reason(&self) -> Option<ErrorReason> {
        match &self.outcome {
            Outcome::Ok { .. } => None,
            Outcome::Error { reason, .. } => Some(*reason),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}
