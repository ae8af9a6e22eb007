use std::future::Future;
use std::time::Duration;

use tracing::warn;

use drover_core::config::RetryConfig;
use drover_core::error::Result;

/// Exponential backoff for the given zero-based attempt, with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `op`, retrying transient queue/store failures with bounded backoff.
///
/// Only errors for which `is_retryable()` holds are retried; anything else
/// (and the last transient error once the budget is spent) is returned.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use drover_core::error::DroverError;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let third = calculate_backoff(2, &config).as_millis();
        assert!((320..=480).contains(&third));
        let capped = calculate_backoff(20, &config).as_millis();
        assert!(capped <= 1200);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let value = with_backoff(&fast(), "enqueue", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DroverError::QueueUnavailable("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast(), "enqueue", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DroverError::Database("database is locked".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast(), "load", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DroverError::InvalidWorkflow("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(DroverError::InvalidWorkflow(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
