//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Number of retries after the first attempt
    #[must_use]
    pub fn max_retries(&self) -> usize {
        if self.enabled {
            self.max_attempts.saturating_sub(1) as usize
        } else {
            0
        }
    }

    /// Create an exponential backoff builder
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn create_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.max_retries())
            .with_jitter()
    }
}

/// Execute a future with retry logic
///
/// Only errors for which [`Error::is_retryable`] holds are attempted again.
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    f.retry(policy.create_backoff())
        .sleep(tokio::time::sleep)
        .when(Error::is_retryable)
        .notify(|e: &Error, delay: Duration| {
            debug!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %e,
                "Retrying after backoff"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = with_retry(&policy(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::UpstreamUnavailable("503".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::UpstreamUnavailable("502".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = with_retry(&policy(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidGrant("bad code".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidGrant(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_policy_makes_a_single_attempt() {
        let calls = AtomicU32::new(0);
        let mut disabled = policy(5);
        disabled.enabled = false;

        let _: Result<(), Error> = with_retry(&disabled, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::UpstreamUnavailable("503".into()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
