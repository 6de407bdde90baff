//! Retry policies shared by the group supervisor and the storage write path
use std::time::Duration;

/// Delay schedule for repeated attempts.
///
/// Attempt `n` (zero based) waits `initial_delay * growth_factor^n`, capped at `max_delay`.
/// With the default growth factor of `1.0` every attempt waits the same fixed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    growth_factor: f64,
}

impl BackoffPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy {
            initial_delay: delay,
            max_delay: delay,
            growth_factor: 1.0,
        }
    }

    /// Factors below 1.0 are treated as 1.0 and `max_delay` never drops below `initial_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, growth_factor: f64) -> Self {
        BackoffPolicy {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            growth_factor: if growth_factor.is_finite() {
                growth_factor.max(1.0)
            } else {
                1.0
            },
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::fixed(Self::DEFAULT_DELAY)
    }
}

/// What a consumer does with a decoded envelope the store refused.
///
/// Either way the message is acknowledged afterwards (unless its claim ends mid-retry),
/// so a store outage turns the broker's at-least-once delivery into at-most-once for
/// the affected samples.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StoragePolicy {
    /// Log the failure and move on to the next message.
    #[default]
    SkipImmediately,
    /// Try the write up to `attempts` times in total, then skip.
    RetryThenSkip { attempts: u32, backoff: BackoffPolicy },
}

impl StoragePolicy {
    /// Wait before the next write after `failed_attempts` failures, `None` once the
    /// sample should be skipped.
    pub fn retry_delay(&self, failed_attempts: u32) -> Option<Duration> {
        match self {
            StoragePolicy::SkipImmediately => None,
            StoragePolicy::RetryThenSkip { attempts, backoff } => {
                if failed_attempts == 0 || failed_attempts >= *attempts {
                    None
                } else {
                    Some(backoff.delay(failed_attempts - 1))
                }
            }
        }
    }
}
