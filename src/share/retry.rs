//! Driver call retries
//!
//! Transient driver failures are retried with exponential backoff up to a
//! configured number of attempts. Anything else fails immediately.

use crate::config::ManagerConfig;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::ControlPlaneMetrics;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for driver calls
#[derive(Clone)]
pub struct DriverRetry {
    attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    metrics: ControlPlaneMetrics,
}

impl DriverRetry {
    pub fn new(config: &ManagerConfig, metrics: ControlPlaneMetrics) -> Self {
        Self {
            attempts: config.driver_retry_attempts.max(1),
            initial_interval: Duration::from_millis(config.driver_retry_initial_interval_ms),
            max_interval: Duration::from_millis(config.driver_retry_max_interval_ms),
            metrics,
        }
    }

    fn policy(&self) -> impl Backoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run a driver call, retrying transient failures
    pub async fn call<T, F, Fut>(&self, backend: &str, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let limit = self.attempts;
        let metrics = &self.metrics;

        backoff::future::retry(self.policy(), || {
            attempt += 1;
            let current = attempt;
            let pending = call();
            async move {
                match pending.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.action() == ErrorAction::RetryWithBackoff && current < limit => {
                        warn!(
                            "{} on {} failed (attempt {}/{}): {}",
                            operation, backend, current, limit, e
                        );
                        metrics.inc_driver_retry(backend, operation);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}

/// Reason string stored on an entity after a failed operation
pub fn failure_reason(operation: &str, error: &Error) -> String {
    format!("{} failed: {}", operation, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry(attempts: u32) -> DriverRetry {
        let config = ManagerConfig {
            driver_retry_attempts: attempts,
            driver_retry_initial_interval_ms: 1,
            driver_retry_max_interval_ms: 2,
            ..Default::default()
        };
        DriverRetry::new(&config, ControlPlaneMetrics::new().unwrap())
    }

    fn transient() -> Error {
        Error::DriverOperationFailed {
            backend: "b1".into(),
            operation: "create_share".into(),
            reason: "busy".into(),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let retry = retry(3);
        let calls = AtomicU32::new(0);
        let result = retry
            .call("b1", "create_share", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retry.metrics.driver_retry_count("b1", "create_share"), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let retry = retry(3);
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry
            .call("b1", "create_share", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert_matches!(result, Err(Error::DriverOperationFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let retry = retry(3);
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry
            .call("b1", "delete_share", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::DriverOperationFatal {
                    backend: "b1".into(),
                    operation: "delete_share".into(),
                    reason: "gone".into(),
                })
            })
            .await;

        assert_matches!(result, Err(Error::DriverOperationFatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
