pub mod circuit_breaker;
mod client;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, StateChange,
};
pub use client::{FetchOutcome, HttpClient};
pub use retry::{is_retryable, RetryConfig, RetryConfigBuilder, RetryResult, Retryer};
