//! Backoff delay computation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay every strategy scales from.
const BASE_DELAY_MS: u64 = 1_000;

/// Strategy for spacing retry attempts.
///
/// Attempts are 1-based: the delay before the first retry is `delay(1)`.
///
/// # Examples
///
/// ```rust
/// use retryq_core::backoff::BackoffKind;
/// use std::time::Duration;
///
/// assert_eq!(BackoffKind::Static.delay(3), Duration::from_millis(1000));
/// assert_eq!(BackoffKind::Linear.delay(3), Duration::from_millis(3000));
/// assert_eq!(BackoffKind::Exponential.delay(3), Duration::from_millis(4000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Fixed delay between attempts.
    Static,
    /// Delay grows proportionally with the attempt number.
    Linear,
    /// Delay doubles with every attempt.
    Exponential,
}

impl BackoffKind {
    /// Compute the delay before retry attempt `attempt` (1-based).
    ///
    /// Attempt 0 is the initial call and never waits; passing it here is a
    /// caller bug.
    pub fn delay(self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1, "backoff attempts are 1-based");
        let attempt = attempt.max(1);
        let millis = match self {
            Self::Static => BASE_DELAY_MS,
            Self::Linear => BASE_DELAY_MS * u64::from(attempt),
            Self::Exponential => BASE_DELAY_MS << (attempt - 1).min(32),
        };
        Duration::from_millis(millis)
    }
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Exponential
    }
}
