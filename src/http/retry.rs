//! Retry logic with exponential backoff and jitter.
//!
//! A [`Retryer`] runs an operation up to `max_retries + 1` times. Errors the
//! predicate rejects end the loop at once. Sleeps between attempts honor the
//! retryer's cancellation token, so shutting down never waits out a backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, Result, RollgateError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Default: 3
    pub max_retries: u32,

    /// Delay before the first retry. Default: 100ms
    pub base_delay: Duration,

    /// Upper bound on the exponential delay. Default: 10s
    pub max_delay: Duration,

    /// Relative jitter applied to each delay, in `[0, 1]`. Default: 0.1
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Delay to wait after the failed attempt numbered `attempt` (zero-based).
    ///
    /// `min(base_delay * 2^attempt, max_delay)`, then moved by a uniform random
    /// amount within `±jitter_factor` of itself, never below zero.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_us = self.base_delay.as_micros() as f64;
        let max_us = self.max_delay.as_micros() as f64;

        let exponential = base_us * 2f64.powi(attempt.min(63) as i32);
        let capped = exponential.min(max_us);

        let jitter = if self.jitter_factor > 0.0 {
            let spread = capped * self.jitter_factor;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_micros((capped + jitter).max(0.0).round() as u64)
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter_factor: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }

    pub fn build(self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: self.base_delay.unwrap_or(DEFAULT_BASE_DELAY),
            max_delay: self.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
            jitter_factor: self.jitter_factor.unwrap_or(DEFAULT_JITTER_FACTOR),
        }
    }
}

/// The shared default retry policy.
pub fn is_retryable(error: &RollgateError) -> bool {
    error.is_retryable()
}

/// Result of a retry operation with metadata.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The result value if successful.
    pub value: Option<T>,
    /// The last error if every attempt failed.
    pub error: Option<RollgateError>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Whether the operation succeeded.
    pub success: bool,
}

impl<T> RetryResult<T> {
    pub fn ok(value: T, attempts: u32) -> Self {
        Self {
            value: Some(value),
            error: None,
            attempts,
            success: true,
        }
    }

    pub fn err(error: RollgateError, attempts: u32) -> Self {
        Self {
            value: None,
            error: Some(error),
            attempts,
            success: false,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(RollgateError::new(
                ErrorCode::TaskFailed,
                "retry finished without a result",
            )),
        }
    }
}

/// Runs operations with exponential backoff.
#[derive(Debug, Clone)]
pub struct Retryer {
    config: RetryConfig,
    cancel: CancellationToken,
}

impl Retryer {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to interrupt backoff sleeps.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation`, retrying errors `should_retry` accepts.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let retryer = Retryer::new(RetryConfig::default());
    /// let result = retryer
    ///     .execute(|| async { fetch().await }, is_retryable)
    ///     .await;
    /// println!("took {} attempts", result.attempts);
    /// ```
    pub async fn execute<T, F, Fut, P>(&self, mut operation: F, should_retry: P) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&RollgateError) -> bool,
    {
        let total_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match operation().await {
                Ok(value) => return RetryResult::ok(value, attempts),
                Err(e) => e,
            };

            if !should_retry(&error) || attempts >= total_attempts {
                return RetryResult::err(error, attempts);
            }

            let delay = self.config.calculate_backoff(attempts - 1);
            tracing::debug!(
                "Attempt {} of {} failed ({}), retrying in {:?}",
                attempts,
                total_attempts,
                error,
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return RetryResult::err(
                        RollgateError::new(ErrorCode::RetryCancelled, "retry cancelled during backoff"),
                        attempts,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryConfig {
        RetryConfig::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .jitter_factor(0.0)
            .build()
    }

    #[test]
    fn test_backoff_without_jitter() {
        let config = no_jitter();
        assert_eq!(config.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(config.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(config.calculate_backoff(2), Duration::from_millis(400));
        assert_eq!(config.calculate_backoff(4), Duration::from_millis(1000));
        assert_eq!(config.calculate_backoff(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let config = RetryConfig::builder().jitter_factor(0.5).build();
        for _ in 0..100 {
            let delay = config.calculate_backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let token = CancellationToken::new();
        let retryer = Retryer::new(
            RetryConfig::builder()
                .base_delay(Duration::from_secs(30))
                .jitter_factor(0.0)
                .build(),
        )
        .with_cancellation(token.clone());

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = tokio::spawn(async move {
            retryer
                .execute(
                    || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(RollgateError::new(ErrorCode::NetworkError, "down")) }
                    },
                    is_retryable,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error.unwrap().code, ErrorCode::RetryCancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
