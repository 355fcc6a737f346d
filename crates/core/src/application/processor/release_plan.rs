// Release plan processor
//
// Computes the voucher release plan for a request. Voucher numbering
// continues after the last voucher the upstream knows for the sanatorium.

use super::{RequestProcessor, UpstreamCaller, UpstreamError};
use crate::application::worker::constants::VOUCHER_LIST_PATH;
use crate::domain::{
    CorrelationId, DomainError, ErrorReason, ReleasePlanRequest, RequestMessage, ResponseMessage,
};
use crate::port::{UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

pub struct ReleasePlanProcessor {
    /// Without an upstream, numbering starts at 1
    caller: Option<UpstreamCaller>,
}

impl ReleasePlanProcessor {
    pub fn new(caller: Option<UpstreamCaller>) -> Self {
        Self { caller }
    }

    async fn first_voucher_number(
        &self,
        sanatorium_id: u64,
        correlation_id: &CorrelationId,
    ) -> Result<u64, UpstreamError> {
        let Some(caller) = &self.caller else {
            return Ok(1);
        };

        let request = UpstreamRequest::get(VOUCHER_LIST_PATH)
            .with_query("order_by", "-number")
            .with_query("sanatorium_id", sanatorium_id)
            .with_query("limit", 1)
            .with_correlation_id(correlation_id.as_str());

        let response = caller.call(request).await?;
        let first = next_voucher_number(&response)?;
        debug!(correlation_id = %correlation_id, sanatorium_id, first, "Voucher numbering resolved");
        Ok(first)
    }
}

/// Number following the last issued voucher in `{"rows": [{"number": N}]}`.
/// Restarts at 1 when N is at most 1 or the body cannot be read.
fn next_voucher_number(response: &UpstreamResponse) -> Result<u64, UpstreamError> {
    let last = response
        .json()
        .ok()
        .flatten()
        .and_then(|body| body.get("rows")?.get(0)?.get("number").and_then(as_number));

    match last {
        Some(n) if n > 1 => n.checked_add(1).ok_or_else(|| {
            UpstreamError::InvalidResponse(format!("last voucher number {} cannot be continued", n))
        }),
        _ => Ok(1),
    }
}

fn as_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn invalid_request(id: CorrelationId, error: DomainError) -> ResponseMessage {
    let detail = match error {
        DomainError::ValidationError(message) => message,
        other => other.to_string(),
    };
    ResponseMessage::error(id, ErrorReason::InvalidRequest, Some(detail))
}

#[async_trait]
impl RequestProcessor for ReleasePlanProcessor {
    async fn process(&self, request: &RequestMessage) -> Result<ResponseMessage, UpstreamError> {
        let id = request.correlation_id.clone();

        let plan_request = match ReleasePlanRequest::from_payload(&request.payload) {
            Ok(plan_request) => plan_request,
            Err(e) => return Ok(invalid_request(id, e)),
        };
        let plan = match plan_request.to_plan() {
            Ok(plan) => plan,
            Err(e) => return Ok(invalid_request(id, e)),
        };

        let first_voucher = self
            .first_voucher_number(plan_request.sanatorium_id(), &id)
            .await?;

        let schedule = match plan.schedule(first_voucher) {
            Ok(schedule) => schedule,
            Err(e) => return Ok(invalid_request(id, e)),
        };
        if schedule.is_empty() {
            return Ok(ResponseMessage::error(
                id,
                ErrorReason::InvalidRequest,
                Some("plan period leaves no room for a single arrival".to_string()),
            ));
        }

        let rows = plan_request.rows(&plan, &schedule);
        info!(
            correlation_id = %id,
            release_plan_id = plan_request.id,
            rows = rows.len(),
            first_voucher,
            "Release plan computed"
        );
        Ok(ResponseMessage::ok(id, Value::Array(rows)))
    }
}
