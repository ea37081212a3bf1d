//! Retry strategy with exponential backoff for provider listings.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use siberian_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// A configuration that retries without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries).with_initial_delay(Duration::ZERO)
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Whether a failed call may succeed on a later attempt.
///
/// Configuration and validation problems never heal by themselves;
/// rejected credentials might after a refresh.
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Transport(_) | Error::Auth(_) | Error::Io(_) | Error::Protocol(_) => true,
        Error::Remote { status, .. } => *status == 401 || *status == 429 || *status >= 500,
        _ => false,
    }
}

/// Retry executor for running operations with retry logic.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_recovery(operation, is_transient, |_| async {})
            .await
    }

    /// Execute an operation with a custom retry condition and a recovery
    /// step awaited before every retry.
    ///
    /// `recover` receives the number of the attempt about to be made
    /// (starting at 1). The last error is returned once the retries are
    /// exhausted.
    pub async fn execute_with_recovery<F, Fut, T, C, R, RFut>(
        &self,
        operation: F,
        should_retry: C,
        recover: R,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
        R: Fn(u32) -> RFut,
        RFut: Future<Output = ()>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(
                            "Operation failed after {} attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );

                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    recover(attempt).await;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&Error::Transport("reset".into())));
        assert!(is_transient(&Error::Remote {
            status: 503,
            message: "slow down".into()
        }));
        assert!(!is_transient(&Error::Remote {
            status: 403,
            message: "denied".into()
        }));
        assert!(!is_transient(&Error::Config("bad key".into())));
        assert!(!is_transient(&Error::NotConfigured("s3".into())));
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::new(RetryConfig::immediate(2));
        let result = executor.execute(|| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_recovers_between_attempts() {
        let executor = RetryExecutor::new(RetryConfig::immediate(2));
        let calls = Arc::new(AtomicU32::new(0));
        let recoveries = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute_with_recovery(
                || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(Error::Transport("connection reset".into()))
                        } else {
                            Ok("listed")
                        }
                    }
                },
                is_transient,
                |_| {
                    let recoveries = recoveries.clone();
                    async move {
                        recoveries.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "listed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = RetryExecutor::new(RetryConfig::immediate(2));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport("timeout".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryConfig::immediate(2));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Config("missing bucket".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
