//! Request descriptors: the engine-owned record of a logical request.
//!
//! Per-request configuration travels in an explicit context struct keyed by a
//! stable id; the HTTP payload itself stays unpolluted.

use crate::transport::TransportRequest;
use retryq_core::backoff::BackoffKind;
use retryq_core::policy::StatusClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduling priority of a request. Higher admits first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low = 0,
    /// Everyday traffic.
    #[default]
    Medium = 1,
    /// User-facing traffic.
    High = 2,
    /// Preempts non-critical admission when at or above the blocking
    /// threshold.
    Critical = 3,
}

/// Whether failed requests retry on their own or wait for manual replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// The engine schedules retries itself.
    #[default]
    Automatic,
    /// Failures land in the store for [`retry_failed_requests`].
    ///
    /// [`retry_failed_requests`]: crate::engine::RetryEngine::retry_failed_requests
    Manual,
}

/// Stable identifier of a logical request across all its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an explicit id supplied by the caller.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id from the URL prefix, wall-clock millis, and a
    /// monotonic counter.
    pub(crate) fn generate(url: &str, counter: &AtomicU64) -> Self {
        let prefix: String = url
            .split('?')
            .next()
            .unwrap_or(url)
            .chars()
            .take(48)
            .collect();
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = counter.fetch_add(1, Ordering::Relaxed);
        Self(format!("{prefix}-{millis}-{seq}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Engine-owned record of one logical request across its retries.
///
/// Created at request entry, mutated only by the engine, and dropped on
/// terminal success, terminal failure, or cancellation.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Stable id, unchanged across retries.
    pub id: RequestId,

    /// Scheduling priority.
    pub priority: Priority,

    /// Wall-clock millis of first enqueue; part of the admission ordering.
    pub timestamp_ms: i64,

    /// Current retry attempt; 0 is the initial call.
    pub attempt: u32,

    /// Per-request override of the engine's retry budget.
    pub max_attempts: Option<u32>,

    /// Per-request override of the engine's retry mode.
    pub mode: Option<RetryMode>,

    /// Per-request override of the retryable status table.
    pub retryable_statuses: Option<Vec<StatusClass>>,

    /// Per-request override of the backoff kind.
    pub backoff: Option<BackoffKind>,

    /// Set while an attempt > 0 is in flight.
    pub retrying: bool,

    /// The HTTP payload; opaque to the engine.
    pub request: TransportRequest,
}

impl RequestDescriptor {
    /// Effective retry budget under the engine default.
    pub fn effective_max_attempts(&self, engine_default: u32) -> u32 {
        self.max_attempts.unwrap_or(engine_default)
    }

    /// Effective retry mode under the engine default.
    pub fn effective_mode(&self, engine_default: RetryMode) -> RetryMode {
        self.mode.unwrap_or(engine_default)
    }
}

/// Per-request configuration accepted by
/// [`RetryEngine::execute`](crate::engine::RetryEngine::execute).
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub(crate) request: TransportRequest,
    pub(crate) id: Option<RequestId>,
    pub(crate) priority: Priority,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) mode: Option<RetryMode>,
    pub(crate) retryable_statuses: Option<Vec<StatusClass>>,
    pub(crate) backoff: Option<BackoffKind>,
    pub(crate) timestamp_ms: Option<i64>,
}

impl RequestOptions {
    /// Wrap a transport request with default per-request configuration.
    pub fn new(request: TransportRequest) -> Self {
        Self {
            request,
            id: None,
            priority: Priority::default(),
            max_attempts: None,
            mode: None,
            retryable_statuses: None,
            backoff: None,
            timestamp_ms: None,
        }
    }

    /// Supply an explicit request id.
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the scheduling priority (default [`Priority::Medium`]).
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the engine's retry budget for this request.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the engine's retry mode for this request.
    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Override the retryable status table for this request.
    pub fn with_retryable_statuses(mut self, statuses: Vec<StatusClass>) -> Self {
        self.retryable_statuses = Some(statuses);
        self
    }

    /// Override the backoff kind for this request.
    pub fn with_backoff(mut self, backoff: BackoffKind) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Pin the first-enqueue timestamp (wall-clock millis).
    ///
    /// Mostly useful in tests that exercise admission ordering.
    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

impl From<TransportRequest> for RequestOptions {
    fn from(request: TransportRequest) -> Self {
        Self::new(request)
    }
}
