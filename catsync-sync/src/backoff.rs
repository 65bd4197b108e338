//! Bounded exponential backoff around catalog queries.

use std::future::Future;
use std::time::Duration;

use catsync_core::{CancellationToken, CatalogError};

use crate::error::SyncError;

/// First retry delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound for a single delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Retries after the first failed attempt. Keeps a broken client from
/// retrying forever.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, the retry budget is spent or `token` is
    /// cancelled.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CatalogError>>,
    {
        let mut attempts = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                result = op() => result,
            };
            attempts += 1;
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempts > self.max_retries {
                return Err(SyncError::RetriesExhausted {
                    operation,
                    attempts,
                    source: err,
                });
            }

            let delay = self.delay(attempts);
            tracing::warn!(
                operation,
                attempt = attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "catalog query failed, will retry",
            );
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
