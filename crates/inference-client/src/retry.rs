use crate::error::InferenceError;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Bounded retry with exponential backoff. The delay after the failed attempt
/// `i` (0-based) is `base_delay * 2^i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

/// Passed to the retry observer right before the backoff sleep.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// 0-based index of the attempt that just failed
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a InferenceError,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that performs exactly one attempt
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut, O>(&self, mut op: F, mut on_retry: O) -> Result<T, InferenceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
        O: FnMut(RetryEvent<'_>),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt + 1 >= max_attempts {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            on_retry(RetryEvent {
                attempt,
                max_attempts,
                error: &err,
                delay,
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
