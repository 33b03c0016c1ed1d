//! Capped exponential backoff for embedding provider calls.

use crate::config::RetryConfig;
use crate::error::EmbeddingError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Execute an async operation, retrying rate-limited attempts with backoff.
///
/// Only `EmbeddingError::RateLimited` is retried; every other error returns
/// immediately. When the attempt budget runs out the last error is wrapped in
/// `EmbeddingError::RetriesExhausted`.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, EmbeddingError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, EmbeddingError>>,
{
    let attempts = config.max_retries + 1;
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        attempt += 1;
        if !is_retryable(&err) {
            return Err(err);
        }
        if attempt >= attempts {
            tracing::warn!(attempts, error = %err, "Retry budget exhausted");
            return Err(EmbeddingError::RetriesExhausted {
                attempts,
                source: Box::new(err),
            });
        }

        let backoff_ms = compute_backoff(config, attempt - 1, &err);
        tracing::warn!(
            attempt,
            max = attempts,
            backoff_ms,
            error = %err,
            "Retrying after rate limit"
        );
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }
}

/// Whether an error is transient within a single call.
pub fn is_retryable(err: &EmbeddingError) -> bool {
    matches!(err, EmbeddingError::RateLimited { .. })
}

/// Backoff delay, honoring the provider's retry-after up to the configured cap.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &EmbeddingError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let EmbeddingError::RateLimited { retry_after_secs } = err {
        let server_ms = retry_after_secs.saturating_mul(1000);
        return server_ms.max(computed).min(config.max_backoff_ms);
    }
    computed
}

/// Exponential backoff with up to 25% jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        let jitter = (capped as f64 * 0.25 * rand::thread_rng().r#gen::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_exponential_backoff(&config, 0), 1000);
        assert_eq!(compute_exponential_backoff(&config, 1), 2000);
        assert_eq!(compute_exponential_backoff(&config, 2), 4000);
    }

    #[test]
    fn test_compute_backoff_respects_cap() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_exponential_backoff(&config, 2), 3000);
        let err = EmbeddingError::RateLimited {
            retry_after_secs: 30,
        };
        assert_eq!(compute_backoff(&config, 0, &err), 3000);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..fast_config(1)
        };
        let config = RetryConfig {
            initial_backoff_ms: 400,
            max_backoff_ms: 400,
            ..config
        };
        for _ in 0..50 {
            let ms = compute_exponential_backoff(&config, 0);
            assert!((400..=500).contains(&ms));
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_rate_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = with_retry(&fast_config(2), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EmbeddingError::RateLimited {
                        retry_after_secs: 0,
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_to_typed_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = with_retry(&fast_config(2), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(EmbeddingError::RateLimited {
                    retry_after_secs: 0,
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(EmbeddingError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_provider_unavailable_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = with_retry(&fast_config(3), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(EmbeddingError::ProviderUnavailable {
                    provider: "openai".into(),
                    message: "503".into(),
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(EmbeddingError::ProviderUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
