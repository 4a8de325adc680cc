use std::future::Future;
use std::time::Duration;

use super::classification::ErrorClassification;
use super::types::PatchvalError;
use tracing::warn;

impl ErrorClassification {
    /// Calculate the retry delay for this error classification based on the
    /// current attempt number (0-indexed).
    ///
    /// - NoCapacityError: 500ms * 2^attempt + jitter, capped at 10s
    /// - Default: exponential backoff 2^attempt + random jitter (0-1s), capped at 30s
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        match self.error_type {
            "NoCapacityError" => {
                let base = 0.5 * 2.0_f64.powi(attempt as i32);
                let jitter: f64 = rand::random::<f64>() * 0.25;
                Duration::from_secs_f64((base + jitter).min(10.0))
            }
            _ => {
                let base: f64 = 2.0_f64.powi(attempt as i32);
                let jitter: f64 = rand::random::<f64>();
                Duration::from_secs_f64((base + jitter).min(30.0))
            }
        }
    }
}

/// Retry configuration for sandbox acquisition and other transient operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Skip the backoff sleep entirely (tests).
    pub no_delay: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            no_delay: false,
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Retries only if the error is classified as retryable and we haven't
/// exceeded max_retries.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut factory: F,
) -> Result<T, PatchvalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PatchvalError>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        let err = match factory().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let classification = err.classify();
        if !classification.retryable || attempt + 1 >= max_attempts {
            if classification.retryable {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max = max_attempts,
                    "Max retries exhausted"
                );
            }
            return Err(err);
        }

        let delay = classification.retry_delay(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max = max_attempts,
            error_type = classification.error_type,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after error"
        );
        if !config.no_delay {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_delay_no_capacity_capped() {
        let class = ErrorClassification { error_type: "NoCapacityError", retryable: true, fatal: false, terminal: false };
        let d0 = class.retry_delay(0);
        assert!(d0.as_secs_f64() >= 0.5 && d0.as_secs_f64() < 0.8);
        assert!(class.retry_delay(12) <= Duration::from_secs(10));
    }

    #[test]
    fn test_retry_delay_default_exponential() {
        let class = ErrorClassification { error_type: "DockerError", retryable: true, fatal: false, terminal: false };
        let d1 = class.retry_delay(1);
        assert!(d1.as_secs_f64() >= 2.0 && d1.as_secs_f64() < 3.0);
        assert!(class.retry_delay(10) <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_try() {
        let config = RetryConfig::default();
        let result = with_retry("test", &config, || async { Ok::<_, PatchvalError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_no_capacity() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig { max_retries: 3, no_delay: true };

        let result = with_retry("acquire", &config, || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PatchvalError::NoCapacity("busy".into()))
                } else {
                    Ok("sandbox")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "sandbox");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig { max_retries: 3, no_delay: true };

        let result = with_retry("acquire", &config, || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PatchvalError::image_missing("CVE-1", "gone"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig { max_retries: 2, no_delay: true };

        let result = with_retry("acquire", &config, || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PatchvalError::NoCapacity("busy".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(PatchvalError::NoCapacity(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
