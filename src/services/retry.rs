//! Bounded retry around remote calls. Only network-class failures are retried.

use std::{future::Future, time::Duration};

use tokio::time::timeout;
use tokio_retry::{
    RetryIf,
    strategy::{ExponentialBackoff, jitter},
};
use tracing::{debug, warn};

use crate::{
    config::RetryConfig,
    dao::storage::{StorageError, StorageResult},
};

/// Attempt budget, backoff and per-attempt timeout shared by every remote call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: usize,
    base_delay: Duration,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base_delay: config.base_delay,
            call_timeout: config.call_timeout,
        }
    }

    /// Run `action`, retrying network failures with exponential backoff.
    ///
    /// Each attempt is bounded by the call timeout; a timeout counts as a network failure.
    /// Duplicates and application errors are returned at once.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut action: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let limit = self.call_timeout;
        let mut failures = 0usize;

        let result = RetryIf::spawn(
            self.strategy(),
            || {
                let attempt = action();
                async move {
                    match timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(StorageError::offline(format!(
                            "{operation} timed out after {}ms",
                            limit.as_millis()
                        ))),
                    }
                }
            },
            |err: &StorageError| {
                failures += 1;
                let retry = err.is_retryable();
                if retry {
                    debug!(operation, attempt = failures, error = %err, "retrying remote call");
                }
                retry
            },
        )
        .await;

        match &result {
            Err(err) if err.is_retryable() => {
                warn!(operation, attempts = self.attempts, error = %err, "remote call failed after retries");
            }
            _ => {}
        }
        result
    }

    /// Delays between attempts: `base_delay`, then doubling, each jittered.
    fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = u64::try_from(self.base_delay.as_millis() / 2)
            .unwrap_or(u64::MAX)
            .max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.call_timeout)
            .map(jitter)
            .take(self.attempts - 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
