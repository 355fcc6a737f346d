// Upstream Port (Interface)

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Request against the upstream HTTP service, relative to its base URL
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Propagated as the `X-Correlation-Id` header
    pub correlation_id: Option<String>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
            correlation_id: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            correlation_id: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as JSON; `None` for an empty body
    pub fn json(&self) -> Result<Option<Value>, serde_json::Error> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&self.body).map(Some)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure before any HTTP status was received (always transient)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Upstream HTTP client interface
///
/// Implementations return every HTTP status as `Ok`; classifying statuses
/// is left to the caller.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    type Outcome = Result<UpstreamResponse, TransportError>;

    /// Replays scripted outcomes in order, then falls back to a fixed one
    pub struct ScriptedUpstream {
        script: Mutex<VecDeque<Outcome>>,
        fallback: Outcome,
        delay: Duration,
        requests: Mutex<Vec<UpstreamRequest>>,
    }

    impl ScriptedUpstream {
        /// Every call answers with `fallback` unless scripted otherwise
        pub fn new(fallback: Outcome) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Always answers 200 with `body`
        pub fn ok_json(body: Value) -> Self {
            Self::new(Ok(UpstreamResponse::new(200, body.to_string())))
        }

        /// Always answers with `status` and an empty body
        pub fn status(status: u16) -> Self {
            Self::new(Ok(UpstreamResponse::new(status, Vec::new())))
        }

        pub fn then(self, outcome: Outcome) -> Self {
            self.script.lock().unwrap().push_back(outcome);
            self
        }

        pub fn then_status(self, status: u16) -> Self {
            self.then(Ok(UpstreamResponse::new(status, Vec::new())))
        }

        /// Hold every call for `delay` before answering
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<UpstreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
            self.requests.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_json() {
        let resp = UpstreamResponse::new(200, r#"{"valid":true}"#);
        assert!(resp.is_success());
        assert_eq!(resp.json().unwrap(), Some(json!({"valid": true})));

        assert_eq!(UpstreamResponse::new(204, "").json().unwrap(), None);
        assert!(UpstreamResponse::new(200, "<html>").json().is_err());
        assert!(!UpstreamResponse::new(503, "").is_success());
    }

    #[test]
    fn test_request_builders() {
        let req = UpstreamRequest::get("/api/v1.0/voucher/")
            .with_query("limit", 1)
            .with_correlation_id("abc");
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.query, vec![("limit".to_string(), "1".to_string())]);
        assert_eq!(req.correlation_id.as_deref(), Some("abc"));
    }
}
