//! Retry combinators
//!
//! `retry_with_backoff` retries transient failures with exponential backoff.
//! `poll_until` repeats a check at a fixed interval until it yields a value
//! or a deadline passes; it is shared by every submit-then-confirm broker flow.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// Backoff policy for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles every retry
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op`, retrying while it fails with a transient error.
/// Non-transient errors are returned on first occurrence.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(
                    op = op_name,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Returned by [`poll_until`] when the deadline passes without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Call `check` every `interval` until it returns `Ok(Some(_))` or `deadline`
/// has elapsed. `Ok(None)` means "not yet"; `Err` is logged and polling
/// continues.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    mut check: F,
) -> std::result::Result<T, DeadlineExceeded>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    let polling = async {
        loop {
            attempts += 1;
            match check(attempts).await {
                Ok(Some(value)) => return value,
                Ok(None) => debug!(attempt = attempts, "poll not resolved yet"),
                Err(e) => warn!(attempt = attempts, error = %e, "poll attempt failed"),
            }
            sleep(interval).await;
        }
    };

    let outcome = tokio::time::timeout(deadline, polling).await;
    match outcome {
        Ok(value) => Ok(value),
        Err(_) => Err(DeadlineExceeded {
            attempts,
            elapsed: started.elapsed(),
        }),
    }
}

impl From<DeadlineExceeded> for RelayError {
    fn from(e: DeadlineExceeded) -> Self {
        RelayError::Timeout(format!(
            "no result after {} attempts in {}ms",
            e.attempts,
            e.elapsed.as_millis()
        ))
    }
}
