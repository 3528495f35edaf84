//! Rollgate Rust SDK
//!
//! Client-side boolean feature flags with a stale-while-revalidate cache, a
//! circuit breaker, retries with backoff, deterministic percentage rollouts
//! and optional push updates over server-sent events.
//!
//! # Quick Start
//!
//! ```no_run
//! use rollgate::{RollgateClient, RollgateOptions, UserContext};
//!
//! #[tokio::main]
//! async fn main() -> rollgate::Result<()> {
//!     let options = RollgateOptions::builder("sdk_your_api_key")
//!         .enable_streaming(true)
//!         .build();
//!     let client = RollgateClient::new(options)?;
//!     client.initialize().await?;
//!
//!     client
//!         .identify(UserContext::builder("user-123").email("a@example.com").build())
//!         .await?;
//!
//!     let dark_mode = client.is_enabled("dark-mode", false);
//!     let detail = client.is_enabled_detail("new-checkout", false);
//!     println!("{} ({})", dark_mode, detail.reason.kind());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;
pub mod evaluation;
pub mod http;
pub mod types;
pub mod utils;
mod client;

/// Reported to the flag service in `X-SDK-Name`.
pub const SDK_NAME: &str = "rollgate-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use client::RollgateClient;

pub use error::{ErrorCategory, ErrorCode, Result, RollgateError};

pub use types::{
    AttributeValue, EvaluationDetail, EvaluationErrorKind, EvaluationReason, FlagSet,
    UserContext, UserContextBuilder,
};

pub use crate::core::{
    CacheConfig, CacheStats, EventsConfig, FlagCache, MetricsSnapshot, RequestDeduplicator,
    RollgateOptions, RollgateOptionsBuilder, StreamConfig, TelemetryConfig, TelemetryStats,
    TrackEvent,
};

pub use http::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, RetryConfig,
    RetryResult, Retryer,
};

pub use evaluation::{is_in_rollout, Condition, FlagRule, LocalEvaluator, TargetingRule};

pub use utils::{compare_versions, parse_version, ParsedVersion};
