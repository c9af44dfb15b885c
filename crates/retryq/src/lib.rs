#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Client-side HTTP retry and admission-control middleware.
//!
//! retryq sits between an application and its HTTP transport and provides:
//!
//! - **Bounded concurrency with priority scheduling** — a stable priority
//!   queue admits requests under a concurrency cap, with critical-request
//!   preemption ([`admission::AdmissionController`]).
//! - **Automatic retries** — backoff-driven, cancellable, bounded per
//!   request ([`engine::RetryEngine`]).
//! - **Manual replay** — terminally failed requests land in a bounded store
//!   and can be replayed on demand.
//! - **Cancellation** — per-request and global, covering queued, in-flight,
//!   and sleeping requests.
//! - **Circuit breaking** — a failure-threshold state machine wrapping the
//!   transport ([`breaker::CircuitBreaker`]).
//! - **Plugins and hooks** — versioned plugins observing the lifecycle
//!   through a typed event bus ([`hooks::HookBus`], [`plugin::RetryPlugin`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use retryq::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), retryq::RetryError> {
//! let transport = Arc::new(HttpTransport::new().expect("transport"));
//! let engine = RetryEngine::new(
//!     transport,
//!     EngineConfig::builder()
//!         .retries(3)
//!         .max_concurrent_requests(5)
//!         .build(),
//! )?;
//!
//! let response = engine
//!     .execute(
//!         RequestOptions::new(TransportRequest::get("https://api.example.com/items"))
//!             .with_priority(Priority::High),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod breaker;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod middleware;
pub mod plugin;
pub mod queue;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use descriptor::{Priority, RequestDescriptor, RequestId, RequestOptions, RetryMode};
pub use engine::{RetryEngine, RetryEngineBuilder};
pub use error::{Result, RetryError};
pub use hooks::{EventKind, RetryEvent, RetryHooks};
pub use metrics::MetricsSnapshot;
pub use transport::{
    HttpTransport, Transport, TransportError, TransportRequest, TransportResponse,
};

// Re-export the core primitives at the crate root for convenience.
pub use retryq_core::backoff::BackoffKind;
pub use retryq_core::policy::{RetryPolicy, StatusClass};
pub use retryq_core::timer::{TimerOutcome, TimerRegistry};

/// Convenient re-exports of commonly used items.
///
/// ```rust
/// use retryq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMode};
    pub use crate::config::EngineConfig;
    pub use crate::descriptor::{Priority, RequestId, RequestOptions, RetryMode};
    pub use crate::engine::RetryEngine;
    pub use crate::error::RetryError;
    pub use crate::hooks::{EventKind, RetryEvent, RetryHooks};
    pub use crate::plugin::{PluginOptions, RetryPlugin};
    pub use crate::transport::{
        HttpTransport, Transport, TransportError, TransportRequest, TransportResponse,
    };
    pub use retryq_core::backoff::BackoffKind;
    pub use retryq_core::policy::StatusClass;
}
