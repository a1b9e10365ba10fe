//! Retry policy and the backoff loop that consumes it.
//!
//! The loop knows nothing about what it retries. Callers hand it an async
//! operation and an error type that says whether a failure is worth retrying.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use demandflow_llm::LlmError;
use demandflow_messaging::QueueError;

/// Errors that can say whether another attempt might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (values below 1 behave as 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied per further failure
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); the delay varies by up to this fraction either way
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays and no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Create a policy with doubling delays.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = self.multiplier.max(1.0).powi((attempt - 1).min(i32::MAX as u32) as i32);
        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Delay after failed attempt `attempt` (1-indexed), jittered and capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let nominal_ms = nominal.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let offset = rand::thread_rng().gen_range(-1.0..=1.0) * jitter * nominal_ms;
        Duration::from_millis((nominal_ms + offset).clamp(0.0, max_ms) as u64)
    }

    /// Longest total sleep the loop can spend between attempts, jitter included.
    pub fn max_backoff(&self) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let max_ms = self.max_delay.as_millis() as f64;
        (1..self.attempts())
            .map(|attempt| {
                let nominal_ms = self.nominal_delay(attempt).as_millis() as f64;
                Duration::from_millis((nominal_ms * (1.0 + jitter)).min(max_ms) as u64)
            })
            .sum()
    }

    /// Check if another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts()
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Not worth retrying; returned as soon as it happened.
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u32 },

    /// Every allowed attempt failed transiently.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { last: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Permanent { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// `op` receives the 1-indexed attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + core::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(RetryError::Permanent {
                error,
                attempts: attempt,
            });
        }
        if !policy.should_retry(attempt) {
            return Err(RetryError::Exhausted {
                last: error,
                attempts: attempt,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts = policy.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
