use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Default wait suggested to callers when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Configuration errors
    ConfigInvalidApiKey,
    ConfigInvalidUrl,
    ConfigInvalidCacheTtl,
    ConfigInvalidThreshold,
    ConfigInvalidJitter,

    // Network errors
    NetworkError,
    NetworkTimeout,
    NetworkConnection,

    // HTTP errors
    HttpBadRequest,
    HttpUnauthorized,
    HttpForbidden,
    HttpNotFound,
    HttpRateLimited,
    HttpServerError,
    HttpClientError,
    HttpInvalidResponse,

    // Circuit breaker errors
    CircuitOpen,

    // Cache errors
    CacheReadError,
    CacheWriteError,
    CacheInvalidData,

    // Streaming errors
    StreamConnectFailed,
    StreamReadError,
    StreamParseError,

    // Event errors
    EventSendFailed,

    // Client lifecycle errors
    ClientClosed,
    RetryCancelled,
    TaskFailed,
}

/// Coarse classification used by the retry policy and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Auth,
    RateLimit,
    Validation,
    Server,
    CircuitOpen,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Server => "server",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidApiKey => "CONFIG_INVALID_API_KEY",
            ErrorCode::ConfigInvalidUrl => "CONFIG_INVALID_URL",
            ErrorCode::ConfigInvalidCacheTtl => "CONFIG_INVALID_CACHE_TTL",
            ErrorCode::ConfigInvalidThreshold => "CONFIG_INVALID_THRESHOLD",
            ErrorCode::ConfigInvalidJitter => "CONFIG_INVALID_JITTER",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::NetworkConnection => "NETWORK_CONNECTION",
            ErrorCode::HttpBadRequest => "HTTP_BAD_REQUEST",
            ErrorCode::HttpUnauthorized => "HTTP_UNAUTHORIZED",
            ErrorCode::HttpForbidden => "HTTP_FORBIDDEN",
            ErrorCode::HttpNotFound => "HTTP_NOT_FOUND",
            ErrorCode::HttpRateLimited => "HTTP_RATE_LIMITED",
            ErrorCode::HttpServerError => "HTTP_SERVER_ERROR",
            ErrorCode::HttpClientError => "HTTP_CLIENT_ERROR",
            ErrorCode::HttpInvalidResponse => "HTTP_INVALID_RESPONSE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::CacheReadError => "CACHE_READ_ERROR",
            ErrorCode::CacheWriteError => "CACHE_WRITE_ERROR",
            ErrorCode::CacheInvalidData => "CACHE_INVALID_DATA",
            ErrorCode::StreamConnectFailed => "STREAM_CONNECT_FAILED",
            ErrorCode::StreamReadError => "STREAM_READ_ERROR",
            ErrorCode::StreamParseError => "STREAM_PARSE_ERROR",
            ErrorCode::EventSendFailed => "EVENT_SEND_FAILED",
            ErrorCode::ClientClosed => "CLIENT_CLOSED",
            ErrorCode::RetryCancelled => "RETRY_CANCELLED",
            ErrorCode::TaskFailed => "TASK_FAILED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::NetworkError
            | ErrorCode::NetworkTimeout
            | ErrorCode::NetworkConnection
            | ErrorCode::StreamConnectFailed
            | ErrorCode::StreamReadError => ErrorCategory::Network,
            ErrorCode::HttpUnauthorized | ErrorCode::HttpForbidden => ErrorCategory::Auth,
            ErrorCode::HttpRateLimited => ErrorCategory::RateLimit,
            ErrorCode::HttpBadRequest
            | ErrorCode::HttpClientError
            | ErrorCode::ConfigInvalidApiKey
            | ErrorCode::ConfigInvalidUrl
            | ErrorCode::ConfigInvalidCacheTtl
            | ErrorCode::ConfigInvalidThreshold
            | ErrorCode::ConfigInvalidJitter => ErrorCategory::Validation,
            ErrorCode::HttpServerError => ErrorCategory::Server,
            ErrorCode::CircuitOpen => ErrorCategory::CircuitOpen,
            ErrorCode::HttpNotFound
            | ErrorCode::HttpInvalidResponse
            | ErrorCode::CacheReadError
            | ErrorCode::CacheWriteError
            | ErrorCode::CacheInvalidData
            | ErrorCode::StreamParseError
            | ErrorCode::EventSendFailed
            | ErrorCode::ClientClosed
            | ErrorCode::RetryCancelled
            | ErrorCode::TaskFailed => ErrorCategory::Unknown,
        }
    }

    /// Network, rate-limit and server failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::RateLimit | ErrorCategory::Server
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct RollgateError {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status that produced this error, when there was one.
    pub status: Option<u16>,
    /// Server-suggested wait, only set for rate limiting.
    pub retry_after: Option<Duration>,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl RollgateError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: Some(Arc::new(source)),
            ..Self::new(code, message)
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let detail = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body.trim())
        };

        let (code, message) = match status {
            400 => (ErrorCode::HttpBadRequest, format!("bad request ({})", detail)),
            401 => (ErrorCode::HttpUnauthorized, format!("invalid API key ({})", detail)),
            403 => (ErrorCode::HttpForbidden, format!("access denied ({})", detail)),
            404 => (ErrorCode::HttpNotFound, format!("resource not found ({})", detail)),
            429 => (ErrorCode::HttpRateLimited, format!("rate limited ({})", detail)),
            500..=599 => (ErrorCode::HttpServerError, format!("server error ({})", detail)),
            _ => (ErrorCode::HttpClientError, format!("unexpected response ({})", detail)),
        };

        let mut error = Self::new(code, message);
        error.status = Some(status);
        if code == ErrorCode::HttpRateLimited {
            error.retry_after = Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER));
        }
        error
    }

    pub fn circuit_open() -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            "circuit breaker is open, request rejected",
        )
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::ClientClosed, "client has been closed")
    }

    pub fn config_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn network_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_auth_error(&self) -> bool {
        self.category() == ErrorCategory::Auth
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, RollgateError>;
