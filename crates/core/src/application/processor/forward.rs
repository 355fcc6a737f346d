// Forward processor: one POST per request

use super::{RequestProcessor, UpstreamCaller, UpstreamError};
use crate::domain::{RequestMessage, ResponseMessage};
use crate::port::UpstreamRequest;
use async_trait::async_trait;
use serde_json::Value;

/// Forwards the payload to `POST {base}{path}` and answers with the upstream body
pub struct ForwardProcessor {
    caller: UpstreamCaller,
    path: String,
}

impl ForwardProcessor {
    pub fn new(caller: UpstreamCaller, path: impl Into<String>) -> Self {
        Self {
            caller,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RequestProcessor for ForwardProcessor {
    async fn process(&self, request: &RequestMessage) -> Result<ResponseMessage, UpstreamError> {
        let upstream_request = UpstreamRequest::post(&self.path, request.payload.clone())
            .with_correlation_id(request.correlation_id.as_str());

        let response = self.caller.call(upstream_request).await?;
        let result = response
            .json()
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?
            .unwrap_or(Value::Null);

        Ok(ResponseMessage::ok(request.correlation_id.clone(), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::BackoffPolicy;
    use crate::domain::{CorrelationId, ErrorReason};
    use crate::port::upstream::mocks::ScriptedUpstream;
    use crate::port::{HttpMethod, UpstreamResponse};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn processor(upstream: Arc<ScriptedUpstream>) -> ForwardProcessor {
        let caller = UpstreamCaller::new(upstream, BackoffPolicy::fixed(3, Duration::from_millis(1)));
        ForwardProcessor::new(caller, "/api/v1.0/voucher/validate/")
    }

    fn request() -> RequestMessage {
        RequestMessage {
            correlation_id: CorrelationId::new("abc123"),
            payload: json!({"voucherCode": "X1"}),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_forwards_payload_with_correlation_id() {
        let upstream = Arc::new(ScriptedUpstream::ok_json(json!({"valid": true})));
        let response = processor(upstream.clone()).process(&request()).await.unwrap();

        assert_eq!(
            response,
            ResponseMessage::ok(CorrelationId::new("abc123"), json!({"valid": true}))
        );

        let sent = upstream.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].path, "/api/v1.0/voucher/validate/");
        assert_eq!(sent[0].body, Some(json!({"voucherCode": "X1"})));
        assert_eq!(sent[0].correlation_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_empty_body_is_null_result() {
        let upstream = Arc::new(ScriptedUpstream::status(204));
        let response = processor(upstream).process(&request()).await.unwrap();
        assert_eq!(response, ResponseMessage::ok(CorrelationId::new("abc123"), Value::Null));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_invalid_response() {
        let upstream = Arc::new(ScriptedUpstream::new(Ok(UpstreamResponse::new(
            200,
            "<html>ok</html>",
        ))));
        let err = processor(upstream).process(&request()).await.unwrap_err();
        assert_eq!(err.reason(), ErrorReason::UpstreamInvalidResponse);
    }
}
