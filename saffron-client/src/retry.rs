//! Bounded retry with exponential backoff

use crate::config::ClientConfig;
use crate::error::ClientResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Upper bound for a single backoff step
const MAX_DELAY_SECS: u64 = 60;

/// Retry policy: `1 + max_retries` attempts, waiting `base * 2^n` after the
/// n-th failure. Only transient errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random delay per step
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(MAX_DELAY_SECS),
            jitter: false,
        }
    }

    /// Branch user resolution policy
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.profile_retry_attempts, config.profile_retry_base)
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    tracing::warn!(
                        what = what,
                        attempt = retry + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    tracing::error!(what = what, attempts = retry + 1, "Giving up: {e}");
                    return Err(e);
                }
            }
        }
    }
}
