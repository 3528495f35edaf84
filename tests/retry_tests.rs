use rollgate::http::is_retryable;
use rollgate::{ErrorCode, RetryConfig, Retryer, RollgateError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn fast_config(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter_factor(0.0)
        .build()
}

#[test]
fn test_default_config() {
    let config = RetryConfig::default();

    assert_eq!(config.max_retries, 3);
    assert_eq!(config.base_delay, Duration::from_millis(100));
    assert_eq!(config.max_delay, Duration::from_secs(10));
    assert_eq!(config.jitter_factor, 0.1);
}

#[test]
fn test_backoff_doubles_and_caps() {
    let config = RetryConfig::builder()
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_millis(500))
        .jitter_factor(0.0)
        .build();

    assert_eq!(config.calculate_backoff(0), Duration::from_millis(100));
    assert_eq!(config.calculate_backoff(1), Duration::from_millis(200));
    assert_eq!(config.calculate_backoff(2), Duration::from_millis(400));
    assert_eq!(config.calculate_backoff(3), Duration::from_millis(500));
    assert_eq!(config.calculate_backoff(40), Duration::from_millis(500));
}

#[test]
fn test_retryable_classification() {
    for status in [429, 500, 502, 503, 504] {
        assert!(is_retryable(&RollgateError::from_status(status, "", None)), "{}", status);
    }
    for status in [400, 401, 403, 404, 409] {
        assert!(!is_retryable(&RollgateError::from_status(status, "", None)), "{}", status);
    }
    assert!(is_retryable(&RollgateError::new(ErrorCode::NetworkTimeout, "timeout")));
    assert!(is_retryable(&RollgateError::new(ErrorCode::NetworkConnection, "refused")));
    assert!(!is_retryable(&RollgateError::circuit_open()));
}

#[tokio::test]
async fn test_success_on_first_attempt() {
    let retryer = Retryer::new(fast_config(3));
    let result = retryer.execute(|| async { Ok(42) }, is_retryable).await;

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.value, Some(42));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_non_retryable_error_stops_immediately() {
    let retryer = Retryer::new(fast_config(3));
    let calls = AtomicU32::new(0);

    let result = retryer
        .execute(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RollgateError::from_status(401, "", None))
            },
            is_retryable,
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.error.unwrap().code, ErrorCode::HttpUnauthorized);
}

#[tokio::test]
async fn test_exhausts_all_attempts() {
    let retryer = Retryer::new(fast_config(3));
    let calls = AtomicU32::new(0);

    let result = retryer
        .execute(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RollgateError::from_status(503, "", None))
            },
            is_retryable,
        )
        .await;

    assert_eq!(result.attempts, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(result.into_result().is_err());
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let retryer = Retryer::new(fast_config(3));
    let calls = AtomicU32::new(0);

    let result = retryer
        .execute(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RollgateError::new(ErrorCode::NetworkError, "reset"))
                } else {
                    Ok("ok")
                }
            },
            is_retryable,
        )
        .await;

    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.into_result().unwrap(), "ok");
}

#[tokio::test]
async fn test_custom_predicate() {
    let retryer = Retryer::new(fast_config(2));
    let calls = AtomicU32::new(0);

    let result = retryer
        .execute(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RollgateError::from_status(404, "", None))
            },
            |e| e.code == ErrorCode::HttpNotFound,
        )
        .await;

    assert_eq!(result.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
