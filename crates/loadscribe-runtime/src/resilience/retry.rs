//! Retry with exponential backoff for model calls.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use loadscribe_core::config::LlmConfig;
use loadscribe_core::ConfigError;

use crate::providers::ProviderError;

/// Upper bound on a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff applied to one model call.
///
/// Only errors for which [`ProviderError::is_retryable`] holds are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, min_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay: MAX_DELAY.max(min_delay),
        }
    }

    pub fn from_llm_config(llm: &LlmConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(llm.call_retries as usize, llm.retry_delay()?))
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts - 1)
    }

    /// Run `operation`, retrying retryable failures with backoff.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        operation
            .retry(self.backoff())
            .when(|e: &ProviderError| e.is_retryable())
            .notify(|e: &ProviderError, delay: Duration| {
                warn!(
                    call = label,
                    error = %e,
                    retry_in = %humantime::format_duration(delay),
                    "Model call failed, retrying"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_exhausted() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = fast(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::HttpError("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::HttpError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_auth_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = fast(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::AuthError("bad key".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = fast(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::ApiError {
                        status: 503,
                        message: "busy".into(),
                    })
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_from_llm_config() {
        let llm = LlmConfig {
            call_retries: 5,
            retry_delay: "250ms".into(),
            ..Default::default()
        };
        let policy = RetryPolicy::from_llm_config(&llm).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.min_delay, Duration::from_millis(250));
    }
}
