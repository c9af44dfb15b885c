//! Engine configuration.

use crate::descriptor::{Priority, RetryMode};
use http::Method;
use retryq_core::backoff::BackoffKind;
use retryq_core::policy::{
    DEFAULT_IDEMPOTENCY_HEADER, StatusClass, default_retryable_methods,
    default_retryable_statuses,
};
use std::time::Duration;

/// Configuration for [`RetryEngine`](crate::engine::RetryEngine).
///
/// Build one with [`EngineConfig::builder`]; unset options take the defaults
/// documented on each builder method.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default retry mode for requests that don't override it.
    pub mode: RetryMode,

    /// Default retry budget (retry attempts after the initial call).
    pub retries: u32,

    /// Maximum concurrently admitted requests.
    pub max_concurrent_requests: usize,

    /// Delay of the coalesced dequeue tick.
    pub queue_delay: Duration,

    /// Optional bound on queue length.
    pub max_queue_size: Option<usize>,

    /// Bound on the failed-request store.
    pub max_requests_to_store: usize,

    /// Priority at or above which a request is critical and preempts
    /// non-critical admission. `None` means no request is ever critical.
    pub blocking_queue_threshold: Option<Priority>,

    /// Retryable status codes and ranges.
    pub retryable_statuses: Vec<StatusClass>,

    /// Retryable HTTP methods.
    pub retryable_methods: Vec<Method>,

    /// Header names that mark a write request as safe to retry.
    pub idempotency_headers: Vec<String>,

    /// Default backoff kind.
    pub backoff: BackoffKind,

    /// Surface terminal failures as errors (`true`) or resolve with `None`.
    pub throw_error_on_failed_retries: bool,

    /// Surface cancellations as errors (`true`) or resolve with `None`.
    pub throw_error_on_cancel_request: bool,

    /// Widen per-transition debug logging.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Automatic,
            retries: 3,
            max_concurrent_requests: 5,
            queue_delay: Duration::from_millis(100),
            max_queue_size: None,
            max_requests_to_store: 200,
            blocking_queue_threshold: None,
            retryable_statuses: default_retryable_statuses(),
            retryable_methods: default_retryable_methods(),
            idempotency_headers: vec![DEFAULT_IDEMPOTENCY_HEADER.to_string()],
            backoff: BackoffKind::Exponential,
            throw_error_on_failed_retries: true,
            throw_error_on_cancel_request: true,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Start building a configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Whether `priority` is critical under the blocking threshold.
    pub fn is_critical(&self, priority: Priority) -> bool {
        self.blocking_queue_threshold
            .is_some_and(|threshold| priority >= threshold)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfigParts,
}

#[derive(Debug, Default)]
struct EngineConfigParts {
    mode: Option<RetryMode>,
    retries: Option<u32>,
    max_concurrent_requests: Option<usize>,
    queue_delay: Option<Duration>,
    max_queue_size: Option<usize>,
    max_requests_to_store: Option<usize>,
    blocking_queue_threshold: Option<Priority>,
    retryable_statuses: Option<Vec<StatusClass>>,
    retryable_methods: Option<Vec<Method>>,
    idempotency_headers: Option<Vec<String>>,
    backoff: Option<BackoffKind>,
    throw_error_on_failed_retries: Option<bool>,
    throw_error_on_cancel_request: Option<bool>,
    debug: Option<bool>,
}

impl EngineConfigBuilder {
    /// Default retry mode. Default: [`RetryMode::Automatic`].
    pub fn mode(mut self, mode: RetryMode) -> Self {
        self.config.mode = Some(mode);
        self
    }

    /// Retry budget. Default: 3.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = Some(retries);
        self
    }

    /// Concurrency bound. Default: 5. Must be at least 1.
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = Some(max);
        self
    }

    /// Dequeue tick delay. Default: 100 ms.
    pub fn queue_delay(mut self, delay: Duration) -> Self {
        self.config.queue_delay = Some(delay);
        self
    }

    /// Bound the queue length. Default: unbounded.
    pub fn max_queue_size(mut self, max: usize) -> Self {
        self.config.max_queue_size = Some(max);
        self
    }

    /// Bound the failed-request store. Default: 200.
    pub fn max_requests_to_store(mut self, max: usize) -> Self {
        self.config.max_requests_to_store = Some(max);
        self
    }

    /// Priority at or above which requests preempt. Default: unset (no
    /// request is critical).
    pub fn blocking_queue_threshold(mut self, threshold: Priority) -> Self {
        self.config.blocking_queue_threshold = Some(threshold);
        self
    }

    /// Retryable status table. Default: 408, 429, 500, 502, 503, 504,
    /// 520–527.
    pub fn retryable_statuses(mut self, statuses: Vec<StatusClass>) -> Self {
        self.config.retryable_statuses = Some(statuses);
        self
    }

    /// Retryable methods. Default: GET, HEAD, OPTIONS.
    pub fn retryable_methods(mut self, methods: Vec<Method>) -> Self {
        self.config.retryable_methods = Some(methods);
        self
    }

    /// Idempotency header names. Default: `Idempotency-Key`.
    pub fn idempotency_headers(mut self, headers: Vec<String>) -> Self {
        self.config.idempotency_headers = Some(headers);
        self
    }

    /// Backoff kind. Default: [`BackoffKind::Exponential`].
    pub fn backoff(mut self, backoff: BackoffKind) -> Self {
        self.config.backoff = Some(backoff);
        self
    }

    /// Surface terminal failures as errors. Default: true.
    pub fn throw_error_on_failed_retries(mut self, throw: bool) -> Self {
        self.config.throw_error_on_failed_retries = Some(throw);
        self
    }

    /// Surface cancellations as errors. Default: true.
    pub fn throw_error_on_cancel_request(mut self, throw: bool) -> Self {
        self.config.throw_error_on_cancel_request = Some(throw);
        self
    }

    /// Widen per-transition debug logging. Default: false.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = Some(debug);
        self
    }

    /// Build the configuration, applying defaults to unset options.
    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let parts = self.config;
        EngineConfig {
            mode: parts.mode.unwrap_or(defaults.mode),
            retries: parts.retries.unwrap_or(defaults.retries),
            max_concurrent_requests: parts
                .max_concurrent_requests
                .unwrap_or(defaults.max_concurrent_requests),
            queue_delay: parts.queue_delay.unwrap_or(defaults.queue_delay),
            max_queue_size: parts.max_queue_size.or(defaults.max_queue_size),
            max_requests_to_store: parts
                .max_requests_to_store
                .unwrap_or(defaults.max_requests_to_store),
            blocking_queue_threshold: parts
                .blocking_queue_threshold
                .or(defaults.blocking_queue_threshold),
            retryable_statuses: parts
                .retryable_statuses
                .unwrap_or(defaults.retryable_statuses),
            retryable_methods: parts
                .retryable_methods
                .unwrap_or(defaults.retryable_methods),
            idempotency_headers: parts
                .idempotency_headers
                .unwrap_or(defaults.idempotency_headers),
            backoff: parts.backoff.unwrap_or(defaults.backoff),
            throw_error_on_failed_retries: parts
                .throw_error_on_failed_retries
                .unwrap_or(defaults.throw_error_on_failed_retries),
            throw_error_on_cancel_request: parts
                .throw_error_on_cancel_request
                .unwrap_or(defaults.throw_error_on_cancel_request),
            debug: parts.debug.unwrap_or(defaults.debug),
        }
    }
}
