// Retry with backoff
//
// Shared by broker reconnects (fixed delay) and upstream calls (exponential
// backoff). Both run the same state machine:
//
//   Idle -> Attempting(1) -> Succeeded
//                         -> BackingOff(n) -> Attempting(n+1) -> ...
//                         -> Exhausted | Failed
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay
    Retry(Duration),
    /// Attempt budget spent
    Exhausted,
}

/// Backoff policy
///
/// `delay_for(n)` is the wait after the n-th failed attempt:
/// `min(base_delay * multiplier^(n-1), max_delay)`, optionally with ±10% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Same delay between every attempt
    ///
    /// # Example
    /// ```text
    /// // connection_attempts=5&retry_delay=5
    /// let policy = BackoffPolicy::fixed(5, Duration::from_secs(5));
    /// ```
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Exponentially growing delay, uncapped until `with_max_delay`
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: Duration::MAX,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempt budget; zero is treated as a single attempt
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);

        if self.jitter && !delay.is_zero() {
            // ±10% to avoid synchronized retries across workers
            let jitter_factor = rand::thread_rng().gen_range(0.9..=1.1);
            return delay.mul_f64(jitter_factor);
        }
        delay
    }

    pub fn decide(&self, failed_attempt: u32) -> RetryDecision {
        if failed_attempt >= self.attempts() {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.delay_for(failed_attempt))
        }
    }
}

/// Observable state of one retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Failed { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Succeeded { .. } | RetryState::Exhausted { .. } | RetryState::Failed { .. }
        )
    }
}

/// Drives the retry state machine for a single operation
#[derive(Debug)]
pub struct RetryController {
    policy: BackoffPolicy,
    state: RetryState,
}

impl RetryController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Enter `Attempting`; returns the 1-based attempt number
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = match self.state {
            RetryState::Idle => 1,
            RetryState::BackingOff { attempt, .. } => attempt + 1,
            RetryState::Attempting { attempt } => attempt,
            RetryState::Succeeded { attempts }
            | RetryState::Exhausted { attempts }
            | RetryState::Failed { attempts } => attempts,
        };
        if !self.state.is_terminal() {
            self.state = RetryState::Attempting { attempt };
        }
        attempt
    }

    pub fn record_success(&mut self) {
        self.state = RetryState::Succeeded {
            attempts: self.current_attempt(),
        };
    }

    /// Transient failure: back off or give up
    pub fn record_failure(&mut self) -> RetryDecision {
        let attempt = self.current_attempt();
        let decision = self.policy.decide(attempt);
        self.state = match decision {
            RetryDecision::Retry(delay) => RetryState::BackingOff { attempt, delay },
            RetryDecision::Exhausted => RetryState::Exhausted { attempts: attempt },
        };
        decision
    }

    /// Permanent failure: no further attempts
    pub fn record_permanent_failure(&mut self) {
        self.state = RetryState::Failed {
            attempts: self.current_attempt(),
        };
    }

    fn current_attempt(&self) -> u32 {
        match self.state {
            RetryState::Idle => 0,
            RetryState::Attempting { attempt } | RetryState::BackingOff { attempt, .. } => attempt,
            RetryState::Succeeded { attempts }
            | RetryState::Exhausted { attempts }
            | RetryState::Failed { attempts } => attempts,
        }
    }
}

/// Failure classification returned by a retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// Worth another attempt
    Transient(E),
    /// Retrying cannot help
    Permanent(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    Permanent { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// # Arguments
/// * `policy` - Attempt budget and delays
/// * `operation` - Name used in log fields
/// * `op` - Called with the 1-based attempt number
///
/// # Example
/// ```text
/// let value = retry(&policy, "upstream_call", |attempt| async move {
///     client.send(request.clone()).await.map_err(Failure::Transient)
/// }).await?;
/// ```
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
    E: std::fmt::Display,
{
    let mut controller = RetryController::new(policy.clone());

    loop {
        let attempt = controller.begin_attempt();
        match op(attempt).await {
            Ok(value) => {
                controller.record_success();
                if attempt > 1 {
                    debug!(operation, attempts = attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(Failure::Permanent(error)) => {
                controller.record_permanent_failure();
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            Err(Failure::Transient(error)) => match controller.record_failure() {
                RetryDecision::Retry(delay) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %error,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
            },
        }
    }
}
