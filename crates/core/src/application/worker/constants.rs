// Worker constants (No magic values)
use std::time::Duration;

/// Sleep after a failed subscribe before reconnecting (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Time in-flight messages get to finish after shutdown (30s)
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Deliveries of one message before it is dead-lettered
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Default prefetch: strictly sequential processing
pub const DEFAULT_PREFETCH: u16 = 1;

/// Correlation ids remembered by the in-process redelivery tracker
pub const REDELIVERY_TRACKER_CAPACITY: usize = 10_000;

/// Suffix appended to the request queue name for the default dead-letter queue
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";

/// Header carrying why a message was dead-lettered
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// Header carrying the queue a dead-lettered message came from
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";

/// Broker connect attempts when the URL does not set `connection_attempts`
pub const DEFAULT_CONNECTION_ATTEMPTS: u32 = 5;

/// Delay between broker connect attempts when the URL does not set `retry_delay` (5s)
pub const DEFAULT_CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upstream per-call timeout (10s)
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream attempts for transient failures
pub const DEFAULT_UPSTREAM_MAX_ATTEMPTS: u32 = 3;

/// Upstream backoff base delay (200ms)
pub const DEFAULT_UPSTREAM_BASE_DELAY: Duration = Duration::from_millis(200);

/// Upstream backoff multiplier
pub const DEFAULT_UPSTREAM_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Upstream backoff cap (5s)
pub const DEFAULT_UPSTREAM_MAX_DELAY: Duration = Duration::from_secs(5);

/// Upstream path used in forward mode
pub const DEFAULT_UPSTREAM_PATH: &str = "/api/v1.0/voucher/validate/";

/// Upstream path listing issued vouchers (release plan numbering)
pub const VOUCHER_LIST_PATH: &str = "/api/v1.0/voucher/";
