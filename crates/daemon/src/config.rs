// Worker configuration: optional file, then environment (env wins)

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use vouchers_core::application::worker::constants::*;
use vouchers_core::application::{BackoffPolicy, WorkerConfig};
use vouchers_infra_amqp::BrokerUrl;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "VOUCHERS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/vouchers";

const DEFAULT_AMQP_URL: &str = "amqp://localhost?connection_attempts=5&retry_delay=5";
const DEFAULT_REQUEST_QUEUE: &str = "request_queue";
const DEFAULT_RESPONSE_QUEUE: &str = "response_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    /// POST every payload to the upstream
    Forward,
    /// Compute voucher release plans
    ReleasePlan,
}

impl ProcessorMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(ProcessorMode::Forward),
            "release_plan" | "release-plan" => Ok(ProcessorMode::ReleasePlan),
            other => bail!("PROCESSOR_MODE must be forward or release_plan, got {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    /// `VOUCHERS_URL`; required in forward mode
    pub base_url: Option<String>,
    pub path: String,
    pub timeout: Duration,
    pub policy: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub amqp_url: BrokerUrl,
    pub request_queue: String,
    pub response_queue: String,
    pub dead_letter_queue: String,
    pub prefetch: u16,
    pub max_delivery_attempts: u32,
    pub processor_mode: ProcessorMode,
    pub upstream: UpstreamSettings,
    pub shutdown_timeout: Duration,
}

/// Raw keys as read from file and environment
#[derive(Debug, Default, Deserialize)]
struct PartialSettings {
    amqp_url: Option<String>,
    queue_name_request: Option<String>,
    queue_name_response: Option<String>,
    queue_name_dead_letter: Option<String>,
    prefetch_count: Option<i64>,
    max_delivery_attempts: Option<i64>,
    processor_mode: Option<String>,
    vouchers_url: Option<String>,
    upstream_path: Option<String>,
    upstream_timeout_ms: Option<u64>,
    upstream_max_attempts: Option<i64>,
    upstream_base_delay_ms: Option<u64>,
    upstream_backoff_multiplier: Option<f64>,
    upstream_max_delay_ms: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
}

impl Settings {
    /// Load and validate settings
    ///
    /// Sources, later wins:
    /// 1. `config/vouchers.{toml,yaml,json}` or the file named by `VOUCHERS_CONFIG` (optional)
    /// 2. Environment variables (`AMQP_URL`, `QUEUE_NAME_REQUEST`, ...)
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let config = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let partial: PartialSettings = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        Self::from_partial(partial)
    }

    fn from_partial(partial: PartialSettings) -> Result<Self> {
        let raw_url = partial.amqp_url.as_deref().unwrap_or(DEFAULT_AMQP_URL);
        let amqp_url: BrokerUrl = raw_url.parse().context("Invalid AMQP_URL")?;

        let request_queue = non_empty(
            "QUEUE_NAME_REQUEST",
            partial.queue_name_request,
            DEFAULT_REQUEST_QUEUE,
        )?;
        let response_queue = non_empty(
            "QUEUE_NAME_RESPONSE",
            partial.queue_name_response,
            DEFAULT_RESPONSE_QUEUE,
        )?;
        let dead_letter_queue = non_empty(
            "QUEUE_NAME_DEAD_LETTER",
            partial.queue_name_dead_letter,
            &format!("{}{}", request_queue, DEAD_LETTER_QUEUE_SUFFIX),
        )?;

        let prefetch = in_range(
            "PREFETCH_COUNT",
            partial.prefetch_count,
            i64::from(DEFAULT_PREFETCH),
            1,
            i64::from(u16::MAX),
        )? as u16;
        let max_delivery_attempts = in_range(
            "MAX_DELIVERY_ATTEMPTS",
            partial.max_delivery_attempts,
            i64::from(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            1,
            i64::from(u32::MAX),
        )? as u32;

        let processor_mode = match partial.processor_mode.as_deref() {
            Some(raw) => ProcessorMode::parse(raw)?,
            None => ProcessorMode::Forward,
        };

        let base_url = partial
            .vouchers_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if processor_mode == ProcessorMode::Forward && base_url.is_none() {
            bail!("VOUCHERS_URL is required when PROCESSOR_MODE is forward");
        }

        let upstream_attempts = in_range(
            "UPSTREAM_MAX_ATTEMPTS",
            partial.upstream_max_attempts,
            i64::from(DEFAULT_UPSTREAM_MAX_ATTEMPTS),
            1,
            i64::from(u32::MAX),
        )? as u32;
        let multiplier = partial
            .upstream_backoff_multiplier
            .unwrap_or(DEFAULT_UPSTREAM_BACKOFF_MULTIPLIER);
        if !multiplier.is_finite() || multiplier < 1.0 {
            bail!("UPSTREAM_BACKOFF_MULTIPLIER must be at least 1.0, got {}", multiplier);
        }
        let base_delay = partial
            .upstream_base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_UPSTREAM_BASE_DELAY);
        let max_delay = partial
            .upstream_max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_UPSTREAM_MAX_DELAY);
        let timeout = partial
            .upstream_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);
        if timeout.is_zero() {
            bail!("UPSTREAM_TIMEOUT_MS must be greater than 0");
        }

        let upstream = UpstreamSettings {
            base_url,
            path: partial
                .upstream_path
                .unwrap_or_else(|| DEFAULT_UPSTREAM_PATH.to_string()),
            timeout,
            policy: BackoffPolicy::exponential(upstream_attempts, base_delay, multiplier)
                .with_max_delay(max_delay)
                .with_jitter(true),
        };

        Ok(Self {
            amqp_url,
            request_queue,
            response_queue,
            dead_letter_queue,
            prefetch,
            max_delivery_attempts,
            processor_mode,
            upstream,
            shutdown_timeout: partial
                .shutdown_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.request_queue.clone(), self.response_queue.clone())
            .with_dead_letter_queue(self.dead_letter_queue.clone())
            .with_prefetch(self.prefetch)
            .with_max_delivery_attempts(self.max_delivery_attempts)
            .with_drain_timeout(self.shutdown_timeout)
    }
}

fn non_empty(key: &str, value: Option<String>, default: &str) -> Result<String> {
    match value {
        Some(v) if v.trim().is_empty() => bail!("{} must not be empty", key),
        Some(v) => Ok(v.trim().to_string()),
        None => Ok(default.to_string()),
    }
}

fn in_range(key: &str, value: Option<i64>, default: i64, min: i64, max: i64) -> Result<i64> {
    let value = value.unwrap_or(default);
    if value < min || value > max {
        bail!("{} must be between {} and {}, got {}", key, min, max, value);
    }
    Ok(value)
}
