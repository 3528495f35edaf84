use parking_lot::Mutex;
use rollgate::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorCode, RollgateError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout,
        monitoring_window: Duration::from_secs(60),
        success_threshold,
    }
}

async fn fail(breaker: &CircuitBreaker) {
    let _ = breaker
        .execute(|| async { Err::<(), _>(RollgateError::new(ErrorCode::HttpServerError, "boom")) })
        .await;
}

async fn succeed(breaker: &CircuitBreaker) -> rollgate::Result<u32> {
    breaker.execute(|| async { Ok(7) }).await
}

#[test]
fn test_initial_state_is_closed() {
    let breaker = CircuitBreaker::default();

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.is_closed());
    assert!(!breaker.is_open());
    assert!(!breaker.is_half_open());
    assert!(breaker.is_allowing_requests());
}

#[test]
fn test_default_config() {
    let config = CircuitBreakerConfig::default();

    assert_eq!(config.failure_threshold, 5);
    assert_eq!(config.recovery_timeout, Duration::from_secs(30));
    assert_eq!(config.monitoring_window, Duration::from_secs(60));
    assert_eq!(config.success_threshold, 3);
}

#[tokio::test]
async fn test_opens_after_threshold_failures() {
    let breaker = CircuitBreaker::new(config(3, Duration::from_secs(30), 1));

    fail(&breaker).await;
    fail(&breaker).await;
    assert!(breaker.is_closed());
    assert_eq!(breaker.stats().recent_failures, 2);

    fail(&breaker).await;
    assert!(breaker.is_open());
    assert!(!breaker.is_allowing_requests());
}

#[tokio::test]
async fn test_open_circuit_rejects_without_running() {
    let breaker = CircuitBreaker::new(config(1, Duration::from_secs(30), 1));
    fail(&breaker).await;

    let calls = AtomicU32::new(0);
    let result = breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_instant_recovery_closes_after_one_success() {
    let breaker = CircuitBreaker::new(config(2, Duration::ZERO, 1));

    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    assert_eq!(succeed(&breaker).await.unwrap(), 7);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreaker::new(config(1, Duration::from_millis(20), 2));
    fail(&breaker).await;
    assert!(breaker.is_open());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(breaker.try_acquire());
    assert!(breaker.is_half_open());

    breaker.record_failure();
    assert!(breaker.is_open());
    assert_eq!(breaker.stats().recent_failures, 2);
}

#[tokio::test]
async fn test_half_open_needs_consecutive_successes() {
    let breaker = CircuitBreaker::new(config(1, Duration::ZERO, 3));
    fail(&breaker).await;

    succeed(&breaker).await.unwrap();
    succeed(&breaker).await.unwrap();
    assert!(breaker.is_half_open());
    assert_eq!(breaker.stats().half_open_successes, 2);

    succeed(&breaker).await.unwrap();
    assert!(breaker.is_closed());
}

#[test]
fn test_state_is_not_advanced_by_reads() {
    let breaker = CircuitBreaker::new(config(1, Duration::ZERO, 1));
    breaker.record_failure();

    assert!(breaker.is_allowing_requests());
    assert_eq!(breaker.state(), CircuitState::Open);

    assert!(breaker.try_acquire());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn test_failures_outside_window_are_forgotten() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(30),
        monitoring_window: Duration::from_millis(30),
        success_threshold: 1,
    });

    fail(&breaker).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    fail(&breaker).await;

    assert!(breaker.is_closed());
    assert_eq!(breaker.stats().recent_failures, 1);
}

#[test]
fn test_state_change_notifications() {
    let breaker = CircuitBreaker::new(config(1, Duration::ZERO, 1));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    breaker.on_state_change(move |change| sink.lock().push((change.from, change.to)));

    breaker.record_failure();
    assert!(breaker.try_acquire());
    breaker.record_success();

    assert_eq!(
        *seen.lock(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[test]
fn test_force_open_and_reset() {
    let breaker = CircuitBreaker::default();

    breaker.force_open();
    assert!(breaker.is_open());
    assert!(!breaker.try_acquire());

    breaker.force_reset();
    assert!(breaker.is_closed());
    assert_eq!(breaker.stats().recent_failures, 0);
}

#[test]
fn test_state_as_str() {
    assert_eq!(CircuitState::Closed.as_str(), "closed");
    assert_eq!(CircuitState::Open.as_str(), "open");
    assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
}
