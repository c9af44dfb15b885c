#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Core primitives for the retryq ecosystem.
//!
//! This crate carries the dependency-light building blocks shared by the
//! retryq engine:
//!
//! - **Backoff computation** via [`backoff::BackoffKind`]
//! - **Retry decisions** via [`policy::RetryPolicy`]
//! - **Cancellable timers** via [`timer::TimerRegistry`]
//!
//! # Examples
//!
//! ```rust
//! use retryq_core::prelude::*;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.delay(2, None), Duration::from_millis(2000));
//! ```

pub mod backoff;
pub mod policy;
pub mod timer;

/// Convenient re-exports of commonly used items.
///
/// ```rust
/// use retryq_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backoff::BackoffKind;
    pub use crate::policy::{RetryPolicy, StatusClass};
    pub use crate::timer::{ScheduledSleep, TimerHandle, TimerOutcome, TimerRegistry};
}

pub use backoff::BackoffKind;
pub use policy::{RetryPolicy, StatusClass};
pub use timer::{ScheduledSleep, TimerHandle, TimerOutcome, TimerRegistry};
