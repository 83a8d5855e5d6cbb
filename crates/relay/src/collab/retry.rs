use std::{future::Future, time::Duration};

use tracing::warn;

use super::store::StoreError;

const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Bounded retry for store writes. Only transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(50) }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut run: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(operation, attempt = attempt + 1, error = %error, delay_ms = delay.as_millis() as u64, "store write failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
