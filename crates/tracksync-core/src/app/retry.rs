//! Retry policy: bounded retry with exponential backoff for gateway calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::SyncError;

/// Upper bound for a single backoff sleep.
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Retry policy for transient remote failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts including the first call.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempts` (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at [`MAX_DELAY`].
    /// A negative or NaN product counts as no delay.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        match Duration::try_from_secs_f64(delay_secs) {
            Ok(delay) => delay.min(MAX_DELAY),
            Err(_) if delay_secs > 0.0 => MAX_DELAY,
            Err(_) => Duration::ZERO,
        }
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned as is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    let delay = self.next_delay(attempts);
                    warn!(
                        "{label}: attempt {attempts}/{} failed ({err}), retrying in {delay:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: 5,
        };

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        // attempts=0 behaves like the first retry
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
    }

    #[test]
    fn delays_are_capped_instead_of_overflowing() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            multiplier: 1e300,
            max_attempts: 10,
        };
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(3), MAX_DELAY);
        assert_eq!(policy.next_delay(u32::MAX), MAX_DELAY);

        let negative = RetryPolicy {
            multiplier: -1.0,
            ..policy.clone()
        };
        assert_eq!(negative.next_delay(2), Duration::ZERO);

        let nan = RetryPolicy {
            multiplier: f64::NAN,
            ..policy
        };
        assert_eq!(nan.next_delay(2), Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(3)
            .run("list", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Transient("rate limited".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("close", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Transient("timeout".into()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::Transient(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("update", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Permanent("422".into()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::Permanent(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
