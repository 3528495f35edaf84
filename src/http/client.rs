use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::event_collector::TrackedEvent;
use crate::core::telemetry::TelemetryPayload;
use crate::core::RollgateOptions;
use crate::error::{ErrorCode, Result, RollgateError};
use crate::types::{EvaluationReason, FlagSet, UserContext};

/// Result of a conditional flag fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The server answered 304 for the ETag we sent.
    NotModified,
    Updated {
        flags: FlagSet,
        reasons: HashMap<String, EvaluationReason>,
        etag: Option<String>,
    },
}

#[derive(Deserialize)]
struct FlagsResponse {
    #[serde(default)]
    flags: FlagSet,
    #[serde(default)]
    reasons: HashMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct IdentifyRequest<'a> {
    user: &'a UserContext,
}

#[derive(Serialize)]
struct EventsRequest<'a> {
    events: &'a [TrackedEvent],
}

/// Thin wrapper over the flag service's SDK endpoints.
///
/// Retries and the circuit breaker are applied by the caller; every method
/// here is a single request.
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpClient {
    pub fn new(options: &RollgateOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(format!("{}/{}", crate::SDK_NAME, crate::SDK_VERSION))
            .build()
            .map_err(|e| {
                RollgateError::with_source(ErrorCode::NetworkError, "Failed to create HTTP client", e)
            })?;

        Ok(Self {
            client,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            api_key: options.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/sdk/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header("X-SDK-Name", crate::SDK_NAME)
            .header("X-SDK-Version", crate::SDK_VERSION)
    }

    /// `GET /flags?withReasons=true`, conditional on `etag` when given.
    pub async fn fetch_flags(&self, user_id: Option<&str>, etag: Option<&str>) -> Result<FetchOutcome> {
        let mut query = vec![("withReasons", "true")];
        if let Some(id) = user_id.filter(|id| !id.is_empty()) {
            query.push(("user_id", id));
        }

        let mut request = self.authorize(self.client.get(self.url("flags")).query(&query));
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(convert_error)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!("Flags not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body: FlagsResponse = response.json().await.map_err(|e| {
            RollgateError::with_source(ErrorCode::HttpInvalidResponse, "Failed to parse flags response", e)
        })?;

        Ok(FetchOutcome::Updated {
            flags: body.flags,
            reasons: parse_reasons(body.reasons),
            etag,
        })
    }

    /// `POST /identify` with the user's id, email and attributes.
    pub async fn send_identify(&self, user: &UserContext) -> Result<()> {
        let request = self
            .authorize(self.client.post(self.url("identify")))
            .json(&IdentifyRequest { user });
        self.send_expecting_success(request).await
    }

    /// `POST /events` with a batch of tracked events.
    pub async fn send_events(&self, events: &[TrackedEvent]) -> Result<()> {
        let request = self
            .authorize(self.client.post(self.url("events")))
            .json(&EventsRequest { events });
        self.send_expecting_success(request).await
    }

    /// `POST /telemetry` with per-flag evaluation counts.
    pub async fn send_telemetry(&self, payload: &TelemetryPayload) -> Result<()> {
        let request = self
            .authorize(self.client.post(self.url("telemetry")))
            .json(payload);
        self.send_expecting_success(request).await
    }

    async fn send_expecting_success(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.map_err(convert_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

/// Keep the reasons that parse; a bad entry only loses its own reason.
fn parse_reasons(raw: HashMap<String, serde_json::Value>) -> HashMap<String, EvaluationReason> {
    raw.into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(reason) => Some((key, reason)),
            Err(e) => {
                tracing::debug!("Dropping unparsable reason for {}: {}", key, e);
                None
            }
        })
        .collect()
}

async fn error_from_response(response: reqwest::Response) -> RollgateError {
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    RollgateError::from_status(status.as_u16(), &body, retry_after)
}

/// `Retry-After` in delta-seconds. HTTP-date values are not honored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn convert_error(error: reqwest::Error) -> RollgateError {
    if error.is_timeout() {
        RollgateError::with_source(ErrorCode::NetworkTimeout, "Request timed out", error)
    } else if error.is_connect() {
        RollgateError::with_source(ErrorCode::NetworkConnection, "Connection failed", error)
    } else if error.is_decode() {
        RollgateError::with_source(ErrorCode::HttpInvalidResponse, "Invalid response body", error)
    } else {
        RollgateError::with_source(ErrorCode::NetworkError, format!("Network error: {}", error), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_reasons_drops_bad_entries() {
        let raw = HashMap::from([
            ("a".to_string(), serde_json::json!({"kind": "TARGET_MATCH"})),
            ("b".to_string(), serde_json::json!({"kind": "SOMETHING_NEW"})),
            ("c".to_string(), serde_json::json!("garbage")),
        ]);
        let reasons = parse_reasons(raw);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons["a"], EvaluationReason::TargetMatch);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_retry_after_ignores_http_date() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}
