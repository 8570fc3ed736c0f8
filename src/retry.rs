//! Bounded exponential backoff for read paths.
//!
//! Only transient store failures (SQLite busy/locked) are retried; business
//! errors surface on the first attempt so the UI can react to them.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub async fn retry_transient<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                debug!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(label, attempts = attempt + 1, error = %e, "Giving up after retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CashError;

    fn busy() -> CashError {
        CashError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mut calls = 0;
        let result = retry_transient(&fast_policy(2), "test", || {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&fast_policy(1), "test", || {
            calls += 1;
            Err(busy())
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&fast_policy(3), "test", || {
            calls += 1;
            Err(CashError::InvalidState("Session already closed".into()))
        })
        .await;
        assert!(matches!(result, Err(CashError::InvalidState(_))));
        assert_eq!(calls, 1);
    }
}
