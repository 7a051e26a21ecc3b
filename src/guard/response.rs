//! Transport-agnostic rendering of denied attempts.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TOO_MANY_REQUESTS_TEXT: &str = "Too many requests in this time frame.";

/// How an adapter should answer a denied attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Reject with 429 and an error body
    #[default]
    TooManyRequests,
    /// Reject with 403 and an error body
    Forbidden,
    /// Set 429 and `Retry-After`, then let the request through
    Mark,
}

/// What an adapter should send back for a denied attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureResponse {
    pub status: u16,
    /// Value for the `Retry-After` header
    pub retry_after_secs: u64,
    pub body: Option<serde_json::Value>,
    /// Whether the request should continue to its handler
    pub proceed: bool,
    pub next_valid_request: DateTime<Utc>,
}

impl FailureResponse {
    pub fn render(mode: FailureMode, retry_after: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let retry_after_secs = retry_after_secs(retry_after, now);
        let error_body = || {
            json!({
                "error": {
                    "text": TOO_MANY_REQUESTS_TEXT,
                    "nextValidRequestDate": retry_after.to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            })
        };

        let (status, body, proceed) = match mode {
            FailureMode::TooManyRequests => (429, Some(error_body()), false),
            FailureMode::Forbidden => (403, Some(error_body()), false),
            FailureMode::Mark => (429, None, true),
        };

        Self {
            status,
            retry_after_secs,
            body,
            proceed,
            next_valid_request: retry_after,
        }
    }

    /// The `Retry-After` header as a name/value pair.
    pub fn retry_after_header(&self) -> (&'static str, String) {
        ("Retry-After", self.retry_after_secs.to_string())
    }
}

/// Whole seconds until `retry_after`, rounded up and never negative.
pub fn retry_after_secs(retry_after: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (retry_after - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis as u64).div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(at(1_500), at(1_000)), 1);
        assert_eq!(retry_after_secs(at(3_000), at(1_000)), 2);
        assert_eq!(retry_after_secs(at(3_001), at(1_000)), 3);
        assert_eq!(retry_after_secs(at(500), at(1_000)), 0);
    }

    #[test]
    fn test_too_many_requests() {
        let response = FailureResponse::render(FailureMode::TooManyRequests, at(2_500), at(0));
        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after_header(), ("Retry-After", "3".to_string()));
        assert!(!response.proceed);

        let body = response.body.unwrap();
        assert_eq!(body["error"]["text"], TOO_MANY_REQUESTS_TEXT);
        assert_eq!(body["error"]["nextValidRequestDate"], "1970-01-01T00:00:02.500Z");
    }

    #[test]
    fn test_forbidden() {
        let response = FailureResponse::render(FailureMode::Forbidden, at(1_000), at(0));
        assert_eq!(response.status, 403);
        assert!(response.body.is_some());
    }

    #[test]
    fn test_mark_lets_request_through() {
        let response = FailureResponse::render(FailureMode::Mark, at(1_000), at(0));
        assert_eq!(response.status, 429);
        assert!(response.body.is_none());
        assert!(response.proceed);
        assert_eq!(response.retry_after_secs, 1);
    }

    #[test]
    fn test_failure_mode_serde_names() {
        let mode: FailureMode = serde_yaml::from_str("too_many_requests").unwrap();
        assert_eq!(mode, FailureMode::TooManyRequests);
        let mode: FailureMode = serde_yaml::from_str("mark").unwrap();
        assert_eq!(mode, FailureMode::Mark);
    }
}
