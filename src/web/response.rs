//! Quota headers and error envelopes.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateDecision;

/// The configured limit.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the window; negative on a rejection.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Window end in seconds since the Unix epoch.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Message carried by every rate limit rejection.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";
/// Message carried by fail-closed store outages.
pub const STORE_UNAVAILABLE: &str = "Rate limit store unavailable";

/// Standard JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// HTTP status code
    pub status_code: u16,
    /// Canonical reason phrase for the status
    pub error: String,
    /// Human-readable detail
    pub message: String,
}

impl ErrorEnvelope {
    /// Build an envelope for `status`.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
        }
    }

    /// Render as a JSON response with the envelope's status.
    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Write the three quota headers for `decision`, replacing existing values.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.total));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

/// The 429 response for a request that exceeded its window.
pub fn too_many_requests(decision: &RateDecision) -> Response {
    let status = StatusCode::TOO_MANY_REQUESTS;
    let mut response = ErrorEnvelope::new(status, RATE_LIMIT_EXCEEDED).into_response_with(status);
    apply_quota_headers(response.headers_mut(), decision);
    response
}

/// The 503 response for a store outage under the fail-closed policy.
pub fn store_unavailable() -> Response {
    let status = StatusCode::SERVICE_UNAVAILABLE;
    ErrorEnvelope::new(status, STORE_UNAVAILABLE).into_response_with(status)
}
