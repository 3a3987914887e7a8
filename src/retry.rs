//! Retry policy for optimistic-concurrency conflicts.
//!
//! Attempt `0` is the initial try and never waits. Retry `n` waits a random
//! duration in `[0, min(max_delay, base_delay * 2^(n-1))]` ("full jitter"), so
//! callers that collided once are unlikely to collide again in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RedbucketError, Result};

/// Default number of compare-and-swap rounds before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
/// Default base backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1);
/// Default backoff cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(50);

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` counts the initial try.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(RedbucketError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if max_delay < base_delay {
            return Err(RedbucketError::Config(format!(
                "retry max_delay ({:?}) must be >= base_delay ({:?})",
                max_delay, base_delay
            )));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
        })
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the wait before `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered wait before `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Serializable form of [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = RedbucketError;

    fn try_from(config: &RetryConfig) -> Result<Self> {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}
