//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::onchain::adapter::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`: base * 2^attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Rate-limited failures wait twice as long.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(call = what, attempt = attempt + 1, "provider call recovered");
                    }
                    return Ok(v);
                }
                Err(e) if !e.is_retryable() || attempt + 1 >= attempts => {
                    warn!(call = what, attempts = attempt + 1, error = %e, "provider call failed");
                    return Err(e);
                }
                Err(e) => {
                    let mut wait = self.delay(attempt);
                    if matches!(e, ProviderError::RateLimited(_)) {
                        wait = (wait * 2).min(self.max_delay * 2);
                    }
                    warn!(
                        call = what,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(9), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("head", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::Transient("boom".into()))
                } else {
                    Ok(7u64)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u64, _> = RetryPolicy::immediate(2)
            .run("head", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::RateLimited("429".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u64, _> = RetryPolicy::immediate(5)
            .run("receipt", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Malformed("bad".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
