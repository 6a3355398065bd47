//! Retry policies for leaf tasks.
//!
//! A task without a policy runs its operation exactly once. With a policy,
//! retryable failures (operation errors and per-attempt timeouts) are
//! retried up to `max_retries` more times, sleeping according to the
//! backoff between attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries when a policy is enabled without a count.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        #[serde(rename = "delay_ms", with = "millis")]
        delay: Duration,
    },
    /// `initial * factor^n`, capped at `max`.
    Exponential {
        #[serde(rename = "initial_ms", with = "millis")]
        initial: Duration,
        #[serde(rename = "max_ms", with = "millis")]
        max: Duration,
        #[serde(default = "default_factor")]
        factor: u32,
    },
}

fn default_factor() -> u32 {
    2
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_millis(100),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let multiplier = factor.checked_pow(retry).unwrap_or(u32::MAX);
                initial
                    .checked_mul(multiplier)
                    .map_or(*max, |d| d.min(*max))
            }
        }
    }
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Never retry. Overrides a pool-wide default policy.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::default(),
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                initial,
                max,
                factor: default_factor(),
            },
        }
    }

    /// Delay before the next attempt, or `None` once `retries_done` retries
    /// have used up the budget.
    pub fn next_delay(&self, retries_done: u32) -> Option<Duration> {
        (retries_done < self.max_retries).then(|| self.backoff.delay_for(retries_done))
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
