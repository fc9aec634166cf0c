//! Bounded retry for balance mutations that lose a lock or serialization race.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use super::ServiceError;

/// Retry policy for contended store transactions.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;
        // up to 25% jitter so colliding writers drift apart
        let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4);
        Duration::from_millis(backoff_ms + jitter)
    }
}

/// Run `operation`, retrying only on [`ServiceError::Contention`].
pub async fn with_contention_retry<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(ServiceError::Contention) if attempt < config.max_retries => {
                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Store contention, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_contention_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_contention_retry(&fast(), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::Contention)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_contention_retry(&fast(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Contention)
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Contention)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_contention_retry(&fast(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::InvalidOtp)
        })
        .await;
        assert!(matches!(result, Err(ServiceError::InvalidOtp)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig::default();
        assert!(config.backoff_duration(10) <= Duration::from_millis(625));
    }
}
