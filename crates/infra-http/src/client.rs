// Upstream HTTP client (reqwest)

use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use vouchers_core::port::{
    HttpMethod, TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse,
};

/// Correlation id propagated to the upstream
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

pub struct ReqwestUpstream {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl ReqwestUpstream {
    /// Create a client for `base_url`; request paths are appended to it
    ///
    /// # Example
    /// ```text
    /// let upstream = ReqwestUpstream::new("http://vouchers:8000", Duration::from_secs(10))?;
    /// ```
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl {
                url: base_url.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        let joined = format!("{}/{}", self.base, path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|e| TransportError::Other(format!("{}: {}", joined, e)))
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis() as u64)
        } else if error.is_connect() {
            TransportError::ConnectionRefused(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        }
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        debug!(method = ?request.method, url = %url, "Upstream request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(id) = &request.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, id);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(UpstreamResponse::new(status, body.to_vec()))
    }
}
