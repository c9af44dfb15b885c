//! Retry decision policy.
//!
//! Decides whether a failed response may be retried and how long to wait
//! before the next attempt. Transport-level failures without a response are
//! judged by the caller (they are always retryable unless synthetic); this
//! policy only looks at responses.

use crate::backoff::BackoffKind;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A retryable HTTP status code or inclusive range of codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusClass {
    /// A single status code.
    Exact(u16),
    /// An inclusive range of status codes.
    Range(u16, u16),
}

impl StatusClass {
    /// Whether `status` falls in this class.
    pub fn contains(&self, status: u16) -> bool {
        match *self {
            Self::Exact(code) => status == code,
            Self::Range(lo, hi) => (lo..=hi).contains(&status),
        }
    }
}

/// Default retryable statuses: timeouts, throttling, server errors, and the
/// CDN 52x family.
pub fn default_retryable_statuses() -> Vec<StatusClass> {
    vec![
        StatusClass::Exact(408),
        StatusClass::Exact(429),
        StatusClass::Exact(500),
        StatusClass::Exact(502),
        StatusClass::Exact(503),
        StatusClass::Exact(504),
        StatusClass::Range(520, 527),
    ]
}

/// Default retryable methods: the safe read-only ones.
pub fn default_retryable_methods() -> Vec<Method> {
    vec![Method::GET, Method::HEAD, Method::OPTIONS]
}

/// Header names whose presence marks a write request as safe to retry.
pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Decides which failures are retryable and how attempts are spaced.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    statuses: Vec<StatusClass>,
    methods: Vec<Method>,
    backoff: BackoffKind,
    idempotency_headers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            statuses: default_retryable_statuses(),
            methods: default_retryable_methods(),
            backoff: BackoffKind::default(),
            idempotency_headers: vec![DEFAULT_IDEMPOTENCY_HEADER.to_string()],
        }
    }
}

impl RetryPolicy {
    /// Create a policy from explicit configuration.
    ///
    /// Method names are matched case-insensitively (`http::Method` is already
    /// normalized uppercase); idempotency header names are matched
    /// case-insensitively against request headers.
    pub fn new(
        statuses: Vec<StatusClass>,
        methods: Vec<Method>,
        backoff: BackoffKind,
        idempotency_headers: Vec<String>,
    ) -> Self {
        Self {
            statuses,
            methods,
            backoff,
            idempotency_headers,
        }
    }

    /// The configured backoff kind.
    pub fn backoff(&self) -> BackoffKind {
        self.backoff
    }

    /// Whether a response with `status` to a `method` request is retryable.
    ///
    /// `overrides`, when present, replaces the configured status list for
    /// this decision (per-request override takes precedence). A write method
    /// carrying an idempotency header is retryable regardless of status.
    pub fn is_retryable_response(
        &self,
        method: &Method,
        status: u16,
        headers: &HeaderMap,
        overrides: Option<&[StatusClass]>,
    ) -> bool {
        let statuses = overrides.unwrap_or(&self.statuses);
        if self.methods.contains(method) && statuses.iter().any(|class| class.contains(status)) {
            return true;
        }
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH)
            && self
                .idempotency_headers
                .iter()
                .any(|name| headers.contains_key(name.to_ascii_lowercase().as_str()))
        {
            return true;
        }
        false
    }

    /// Whether attempt number `attempt` (1-based) may still run under `max`.
    pub fn should_retry(
        &self,
        method: &Method,
        status: u16,
        headers: &HeaderMap,
        overrides: Option<&[StatusClass]>,
        attempt: u32,
        max: u32,
    ) -> bool {
        self.is_retryable_response(method, status, headers, overrides) && attempt <= max
    }

    /// Delay before attempt `attempt`, honoring a per-request backoff override.
    pub fn delay(&self, attempt: u32, override_kind: Option<BackoffKind>) -> Duration {
        override_kind.unwrap_or(self.backoff).delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[rstest]
    #[case(408, true)]
    #[case(429, true)]
    #[case(500, true)]
    #[case(503, true)]
    #[case(521, true)]
    #[case(527, true)]
    #[case(528, false)]
    #[case(404, false)]
    #[case(200, false)]
    fn get_requests_follow_status_table(#[case] status: u16, #[case] expected: bool) {
        assert_eq!(
            policy().is_retryable_response(&Method::GET, status, &HeaderMap::new(), None),
            expected
        );
    }

    #[test]
    fn non_retryable_method_is_rejected_even_for_retryable_status() {
        assert!(!policy().is_retryable_response(&Method::POST, 503, &HeaderMap::new(), None));
    }

    #[test]
    fn idempotency_header_makes_writes_retryable() {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static("abc"));
        let p = policy();
        assert!(p.is_retryable_response(&Method::POST, 503, &headers, None));
        assert!(p.is_retryable_response(&Method::PUT, 404, &headers, None));
        assert!(p.is_retryable_response(&Method::PATCH, 500, &headers, None));
        // DELETE is not in the write set
        assert!(!p.is_retryable_response(&Method::DELETE, 503, &headers, None));
    }

    #[test]
    fn per_request_override_takes_precedence() {
        let p = policy();
        let overrides = [StatusClass::Exact(418)];
        assert!(p.is_retryable_response(&Method::GET, 418, &HeaderMap::new(), Some(&overrides)));
        // 503 is retryable by default but the override replaces the table
        assert!(!p.is_retryable_response(&Method::GET, 503, &HeaderMap::new(), Some(&overrides)));
    }

    #[test]
    fn should_retry_bounds_attempts() {
        let p = policy();
        let headers = HeaderMap::new();
        assert!(p.should_retry(&Method::GET, 503, &headers, None, 3, 3));
        assert!(!p.should_retry(&Method::GET, 503, &headers, None, 4, 3));
    }

    #[test]
    fn delay_honors_override_kind() {
        let p = policy();
        assert_eq!(p.delay(3, None), Duration::from_millis(4_000));
        assert_eq!(
            p.delay(3, Some(BackoffKind::Static)),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn status_range_is_inclusive() {
        let range = StatusClass::Range(520, 527);
        assert!(range.contains(520));
        assert!(range.contains(527));
        assert!(!range.contains(519));
        assert!(!range.contains(528));
    }
}
