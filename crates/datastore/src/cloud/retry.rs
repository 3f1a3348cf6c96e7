use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Retry schedule for cloud transactions. Only errors a transaction may
/// clear by running again are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_max,
        }
    }

    pub fn from_config(cfg: &configs::RetryConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        )
    }

    /// Runs each operation exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Exponential backoff before the given retry (1-based), capped at
    /// `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    pub async fn wait_before_retry(&self, attempt: u32) {
        let backoff = self.backoff(attempt);
        if backoff.is_zero() {
            return;
        }
        debug!(?backoff, attempt, "retrying transaction");
        sleep(backoff).await;
    }

    pub fn should_retry(&self, attempt: u32, error: &StoreError) -> bool {
        if attempt >= self.max_attempts {
            debug!(max_attempts = self.max_attempts, "max retry attempts reached");
            return false;
        }
        error.is_retryable()
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// the policy's attempts are used up.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        policy.wait_before_retry(attempt).await;
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(retries = attempt, "transaction succeeded after retries");
                }
                return Ok(result);
            }
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(attempt, &error) {
                    return Err(error);
                }
                warn!(attempt, %error, "transaction attempt failed");
            }
        }
    }
}
