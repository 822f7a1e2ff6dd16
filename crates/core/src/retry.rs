//! Retries, call deadlines and poll pacing
//!
//! Provider calls made by the executor go through [`with_deadline`] and
//! [`retry_with_backoff`]; long-running server-side copies are polled with
//! [`PollBackoff`].

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Exponent ceiling so the shift cannot overflow
const MAX_DOUBLINGS: u32 = 16;

/// Retry `operation` while `should_retry` accepts its error
///
/// Gives up after `config.max_attempts` calls and returns the last error.
///
/// ```ignore
/// let item = retry_with_backoff(
///     &config.retry,
///     || with_deadline(timeout, store.stat(&uri)),
///     Error::is_retryable,
/// )
/// .await?;
/// ```
pub async fn retry_with_backoff<T, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let mut failures = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        failures += 1;
        if failures >= config.max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = calculate_backoff(config, failures);
        tracing::debug!(
            failures,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Provider call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Run a provider call under a deadline
///
/// Expiry is reported as a transient network error so that the caller's
/// retry policy decides whether the job fails.
pub async fn with_deadline<T, Fut>(deadline: Duration, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, call).await.unwrap_or_else(|_| {
        Err(Error::TransientNetwork(format!(
            "deadline of {}ms exceeded",
            deadline.as_millis()
        )))
    })
}

/// Delay before the next attempt after `failures` consecutive failures
///
/// The base doubles from `initial_backoff_ms` up to `max_backoff_ms`; a
/// jitter of up to the base is added on top.
pub(crate) fn calculate_backoff(config: &RetryConfig, failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(MAX_DOUBLINGS);
    let base = config
        .initial_backoff_ms
        .saturating_mul(1 << doublings)
        .min(config.max_backoff_ms);
    Duration::from_millis(base + jitter(base))
}

fn jitter(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or_default();
    nanos % bound
}

/// Doubling delay between `initial` and `max`, for status polling
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    /// The delay to wait now; the following one doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }
}
