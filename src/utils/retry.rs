//! Bounded retry of transient failures.
//!
//! Only errors whose [`SupervisorError::is_retryable`] is true are retried; every
//! other error is returned from the first attempt.

use crate::constants::{MAX_BACKOFF_DELAY_MS, NETWORK_RETRIES, STARTING_BACKOFF_DELAY_MS};
use crate::core::{Result, SupervisorError};
use std::future::Future;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;

/// Delays between attempts: 200ms, 400ms, ... capped, `NETWORK_RETRIES` entries.
pub fn network_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(STARTING_BACKOFF_DELAY_MS / 2)
        .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS))
        .take(NETWORK_RETRIES)
}

/// Run `action`, retrying transient failures with [`network_backoff`].
pub async fn retry_transient<T, F, Fut>(operation: &str, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    RetryIf::spawn(
        network_backoff(),
        || {
            attempt += 1;
            if attempt > 1 {
                tracing::debug!("Retrying {} (attempt {})", operation, attempt);
            }
            action()
        },
        |e: &SupervisorError| e.is_retryable(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_bounded() {
        let delays: Vec<_> = network_backoff().collect();
        assert_eq!(delays.len(), NETWORK_RETRIES);
        assert_eq!(delays[0], Duration::from_millis(STARTING_BACKOFF_DELAY_MS));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(MAX_BACKOFF_DELAY_MS)));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_transient("test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SupervisorError::network("test", "reset"))
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
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_transient("test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SupervisorError::ReleaseNotFound {
                    tag: "v9".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_transient("test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SupervisorError::network("test", "down"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), NETWORK_RETRIES as u32 + 1);
    }
}
