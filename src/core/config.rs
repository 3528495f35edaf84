use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::cache::CacheConfig;
use crate::core::event_collector::EventsConfig;
use crate::core::stream_client::StreamConfig;
use crate::core::telemetry::TelemetryConfig;
use crate::error::{ErrorCode, Result, RollgateError};
use crate::http::{CircuitBreakerConfig, RetryConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.rollgate.io";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RollgateOptions {
    pub api_key: String,
    pub base_url: String,
    /// Stream endpoint host. Falls back to `base_url`.
    pub stream_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Polling interval. Zero disables polling.
    pub refresh_interval: Duration,
    /// Receive updates over the push stream instead of polling.
    pub enable_streaming: bool,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub events: EventsConfig,
    pub telemetry: TelemetryConfig,
}

impl RollgateOptions {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_url: None,
            timeout: DEFAULT_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            enable_streaming: false,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            stream: StreamConfig::default(),
            events: EventsConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    pub fn builder(api_key: impl Into<String>) -> RollgateOptionsBuilder {
        RollgateOptionsBuilder::new(api_key)
    }

    /// The host the push stream connects to.
    pub fn effective_stream_url(&self) -> &str {
        self.stream_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(RollgateError::config_error(
                ErrorCode::ConfigInvalidApiKey,
                "API key is required",
            ));
        }

        validate_url("base URL", &self.base_url)?;
        if let Some(stream_url) = &self.stream_url {
            validate_url("stream URL", stream_url)?;
        }

        if self.cache.ttl > self.cache.stale_ttl {
            return Err(RollgateError::config_error(
                ErrorCode::ConfigInvalidCacheTtl,
                "Cache TTL must not exceed the stale TTL",
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(RollgateError::config_error(
                ErrorCode::ConfigInvalidThreshold,
                "Circuit breaker thresholds must be positive",
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(RollgateError::config_error(
                ErrorCode::ConfigInvalidJitter,
                "Jitter factor must be between 0 and 1",
            ));
        }

        Ok(())
    }
}

fn validate_url(name: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| {
        RollgateError::config_error(ErrorCode::ConfigInvalidUrl, format!("Invalid {}: {}", name, e))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(RollgateError::config_error(
            ErrorCode::ConfigInvalidUrl,
            format!("Invalid {}: unsupported scheme '{}'", name, scheme),
        )),
    }
}

pub struct RollgateOptionsBuilder {
    options: RollgateOptions,
}

impl RollgateOptionsBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            options: RollgateOptions::new(api_key),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = url.into();
        self
    }

    pub fn stream_url(mut self, url: impl Into<String>) -> Self {
        self.options.stream_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.options.refresh_interval = interval;
        self
    }

    pub fn enable_streaming(mut self, enabled: bool) -> Self {
        self.options.enable_streaming = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.options.circuit_breaker = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.options.cache = config;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache.ttl = ttl;
        self
    }

    pub fn cache_stale_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache.stale_ttl = ttl;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.options.cache.enabled = enabled;
        self
    }

    pub fn persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.cache.persist_path = Some(path.into());
        self
    }

    pub fn stream(mut self, config: StreamConfig) -> Self {
        self.options.stream = config;
        self
    }

    pub fn events(mut self, config: EventsConfig) -> Self {
        self.options.events = config;
        self
    }

    pub fn events_enabled(mut self, enabled: bool) -> Self {
        self.options.events.enabled = enabled;
        self
    }

    pub fn telemetry(mut self, config: TelemetryConfig) -> Self {
        self.options.telemetry = config;
        self
    }

    pub fn telemetry_enabled(mut self, enabled: bool) -> Self {
        self.options.telemetry.enabled = enabled;
        self
    }

    pub fn build(self) -> RollgateOptions {
        self.options
    }
}
