//! Lifecycle metrics.
//!
//! Counters are mutated by the engine at well-defined transitions and
//! published as on-demand [`MetricsSnapshot`]s; nothing fires on raw writes.

use crate::descriptor::Priority;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure with no response.
    Network,
    /// Response with a 5xx status.
    Server5xx,
    /// Response with a 4xx status.
    Client4xx,
    /// Cancelled by the caller, the queue, or shutdown.
    Cancelled,
}

/// Tallies per failure classification.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ErrorKindCounts {
    /// Transport failures without a response.
    pub network: u64,
    /// 5xx responses.
    pub server_5xx: u64,
    /// 4xx responses.
    pub client_4xx: u64,
    /// Cancellations.
    pub cancelled: u64,
}

impl ErrorKindCounts {
    pub(crate) fn record(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::Network => self.network += 1,
            ErrorKind::Server5xx => self.server_5xx += 1,
            ErrorKind::Client4xx => self.client_4xx += 1,
            ErrorKind::Cancelled => self.cancelled += 1,
        }
    }
}

/// Per-priority success/failure tallies for retry attempts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PriorityOutcome {
    /// Retry attempts that succeeded.
    pub successes: u64,
    /// Retry attempts that failed.
    pub failures: u64,
}

/// Outstanding-timer diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimerHealth {
    /// Sleeps outstanding in the timer registry.
    pub active_timers: usize,
    /// Retry sleeps outstanding in the engine.
    pub active_retry_timers: usize,
    /// `active_timers + 2 * active_retry_timers`; zero means no outstanding
    /// waits.
    pub health_score: usize,
}

/// Internal mutable counters. The engine owns exactly one, behind its state
/// lock.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub total_requests: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub canceled_requests: u64,
    pub completely_failed_requests: u64,
    pub completely_failed_critical_requests: u64,
    pub retry_attempts_distribution: BTreeMap<u32, u64>,
    pub requests_by_priority: BTreeMap<Priority, u64>,
    pub retries_by_priority: BTreeMap<Priority, u64>,
    pub priority_outcomes: BTreeMap<Priority, PriorityOutcome>,
    pub error_kinds: ErrorKindCounts,
    pub queue_wait_total: Duration,
    pub retry_delay_total: Duration,
}

impl Metrics {
    pub(crate) fn snapshot(&self, timer_health: TimerHealth) -> MetricsSnapshot {
        let retry_attempts = self.successful_retries + self.failed_retries;
        let avg_queue_wait_secs = if self.total_requests > 0 {
            self.queue_wait_total.as_secs_f64() / self.total_requests as f64
        } else {
            0.0
        };
        let avg_retry_delay_secs = if retry_attempts > 0 {
            self.retry_delay_total.as_secs_f64() / retry_attempts as f64
        } else {
            0.0
        };

        let priority_rates = self
            .priority_outcomes
            .iter()
            .map(|(priority, outcome)| {
                let total = outcome.successes + outcome.failures;
                let (success_rate, failure_rate) = if total > 0 {
                    (
                        outcome.successes as f64 * 100.0 / total as f64,
                        outcome.failures as f64 * 100.0 / total as f64,
                    )
                } else {
                    (0.0, 0.0)
                };
                (
                    *priority,
                    PriorityRates {
                        successes: outcome.successes,
                        failures: outcome.failures,
                        success_rate,
                        failure_rate,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_retries: self.successful_retries,
            failed_retries: self.failed_retries,
            canceled_requests: self.canceled_requests,
            completely_failed_requests: self.completely_failed_requests,
            completely_failed_critical_requests: self.completely_failed_critical_requests,
            retry_attempts_distribution: self.retry_attempts_distribution.clone(),
            requests_by_priority: self.requests_by_priority.clone(),
            retries_by_priority: self.retries_by_priority.clone(),
            error_kinds: self.error_kinds,
            avg_queue_wait_secs,
            avg_retry_delay_secs,
            priority_rates,
            timer_health,
        }
    }
}

/// Per-priority derived rates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PriorityRates {
    /// Retry attempts that succeeded.
    pub successes: u64,
    /// Retry attempts that failed.
    pub failures: u64,
    /// `successes / (successes + failures)` as a percentage.
    pub success_rate: f64,
    /// `failures / (successes + failures)` as a percentage.
    pub failure_rate: f64,
}

/// Read-only view of the engine's metrics at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Attempts that entered the request path (retries re-enter it).
    pub total_requests: u64,
    /// Retry attempts that succeeded.
    pub successful_retries: u64,
    /// Retry attempts that failed.
    pub failed_retries: u64,
    /// Requests cancelled in queue, mid-flight, or during a retry sleep.
    pub canceled_requests: u64,
    /// Store size accumulated at retry-process finalization.
    pub completely_failed_requests: u64,
    /// Critical subset of `completely_failed_requests`.
    pub completely_failed_critical_requests: u64,
    /// Retry attempts issued, keyed by attempt number.
    pub retry_attempts_distribution: BTreeMap<u32, u64>,
    /// Request-path entries keyed by priority.
    pub requests_by_priority: BTreeMap<Priority, u64>,
    /// Retry attempts issued keyed by priority.
    pub retries_by_priority: BTreeMap<Priority, u64>,
    /// Failure classification tallies.
    pub error_kinds: ErrorKindCounts,
    /// Mean seconds spent queued per request-path entry.
    pub avg_queue_wait_secs: f64,
    /// Mean seconds slept per retry attempt.
    pub avg_retry_delay_secs: f64,
    /// Per-priority retry outcome rates.
    pub priority_rates: BTreeMap<Priority, PriorityRates>,
    /// Outstanding-timer diagnostics.
    pub timer_health: TimerHealth,
}
