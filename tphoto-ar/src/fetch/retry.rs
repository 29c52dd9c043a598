//! Retry with exponential backoff for transient backend failures
//!
//! **Algorithm:**
//! 1. Attempt operation
//! 2. On success, return result
//! 3. On a transient error (network, timeout, 5xx, 429, truncated download)
//!    with retries left: log WARN, sleep the current backoff, double it, retry
//! 4. On a non-transient error, or with the budget exhausted: return the error
//!
//! With the default policy the delays are 1s, 2s, 4s (four attempts at most).

use crate::error::Result;
use std::time::Duration;

/// Retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Run `operation` under `policy`, retrying transient failures
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        "Backend operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient backend failure, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Backend operation failed: retry budget exhausted"
                    );
                }
                return Err(err);
            }
        }
    }
}
