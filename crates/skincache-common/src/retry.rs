//! Retry and timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Retryable, TimedOut};

/// Backoff schedule for retried fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Add up to 25% random extra delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self::attempts(1)
    }

    /// `max_attempts` attempts (at least one) with the default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay before `attempt` (1-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            delay + delay.mul_f64(jitter_fraction() * 0.25)
        } else {
            delay
        }
    }
}

/// Cheap jitter source in `0.0..=1.0` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}

/// Retry a fallible async operation with exponential backoff.
///
/// Stops at the first success, at the first error that is not
/// [`Retryable`], or after `max_attempts`; the last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                debug!(attempt, error = %e, "Error is not retryable");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => warn!(attempt, max_attempts, error = %e, "Attempt failed"),
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        debug!(attempt, ?delay, "Retrying");
        sleep(delay).await;
    }
}

/// Run an operation with a deadline.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, TimedOut>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| TimedOut(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Transient(u32),
        Fatal,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            matches!(self, FakeError::Transient(_))
        }
    }

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_attempts_never_zero() {
        assert_eq!(RetryConfig::none().max_attempts, 1);
        assert_eq!(RetryConfig::attempts(0).max_attempts, 1);
        assert_eq!(RetryConfig::attempts(4).max_attempts, 4);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_adds_at_most_a_quarter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(400),
            ..Default::default()
        };
        let delay = config.delay_for_attempt(2);
        assert!(delay >= Duration::from_millis(400));
        assert!(delay <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&quick(3), || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(FakeError::Transient(n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_last_error_returned_when_attempts_run_out() {
        let mut calls = 0;
        let result: Result<(), FakeError> = retry_with_backoff(&quick(2), || {
            calls += 1;
            let n = calls;
            async move { Err(FakeError::Transient(n)) }
        })
        .await;

        assert_eq!(result, Err(FakeError::Transient(2)));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let mut calls = 0;
        let result: Result<(), FakeError> = retry_with_backoff(&quick(5), || {
            calls += 1;
            async { Err(FakeError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(FakeError::Fatal));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert_eq!(result, Err(TimedOut(Duration::from_millis(10))));
    }
}
