//! Bounded retry with exponential backoff.
//!
//! [`RetryPolicy`] is an explicit schedule (attempt bound + doubling delay),
//! so retry behavior is testable without a live broker. The dispatcher drives
//! it attempt-by-attempt to keep its own bookkeeping for dead-lettering; the
//! publisher uses the [`retry`] helper for its delivery-side retries.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// A bounded exponential backoff schedule.
///
/// `delay_after(n)` yields the pause after the n-th failed attempt, or `None`
/// once the attempt bound is exhausted. Delays double from `base_delay` and
/// are capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Handler dispatch schedule: 3 attempts, delays 1s / 2s before the
    /// second and third attempt, then dead-letter.
    pub fn dispatch() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }

    /// Delivery-side schedule for `publish`: quick retries, then surface the
    /// error to the caller.
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Millisecond-scale schedule so tests run fast.
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(16),
        }
    }

    /// Total number of attempts allowed (first try included).
    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after `failed_attempts` failures, or `None` when the
    /// attempt bound is exhausted and the operation must not be retried.
    pub fn delay_after(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts >= self.max_attempts {
            return None;
        }
        // base * 2^(failed_attempts - 1), capped. Shift is bounded to keep
        // the multiplier from overflowing on absurd attempt counts.
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_delay))
    }
}

/// Run `operation` under `policy`, returning the first success or the last
/// error once attempts are exhausted.
pub async fn retry<F, Fut, T, E>(name: &str, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    info!(operation = name, retries = failed, "Operation recovered");
                }
                return Ok(value);
            }
            Err(err) => {
                failed += 1;
                match policy.delay_after(failed) {
                    Some(delay) => {
                        warn!(
                            operation = name,
                            attempt = failed,
                            max_attempts = policy.attempts(),
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "Operation failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}
