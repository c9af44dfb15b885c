//! Caller-facing error types.

use crate::descriptor::{RequestDescriptor, RequestId};
use crate::transport::{TransportError, TransportResponse};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, RetryError>;

/// Errors surfaced to callers of the retry engine.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The admission queue is at `max_queue_size`; the request was rejected
    /// synchronously and never retried.
    #[error("Request queue is full; request {} was rejected", .descriptor.id)]
    QueueFull {
        /// The descriptor that could not be enqueued.
        descriptor: Box<RequestDescriptor>,
    },

    /// The request was cancelled, whether in queue, mid-flight, or during a
    /// retry sleep.
    #[error("Request aborted. ID: {id}")]
    Aborted {
        /// Id of the aborted request.
        id: RequestId,
    },

    /// The queue was cleared while this request was waiting. Observed on
    /// shutdown paths.
    #[error("request queue was cleared")]
    QueueCleared,

    /// The queue was destroyed. Observed on shutdown paths.
    #[error("request queue was destroyed")]
    QueueDestroyed,

    /// The circuit breaker refused the attempt.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Terminal network failure: retries exhausted or the error was not
    /// retryable, and no response exists.
    #[error("request {id} failed: {source}")]
    Transport {
        /// Id of the failed request.
        id: RequestId,
        /// The final transport failure.
        source: TransportError,
    },

    /// Terminal HTTP failure: retries exhausted or the status was not
    /// retryable.
    #[error("request {id} failed with status {status}", status = .response.status)]
    Status {
        /// Id of the failed request.
        id: RequestId,
        /// The final response.
        response: Box<TransportResponse>,
    },

    /// Plugin registration was rejected.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Engine configuration was rejected.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RetryError {
    /// The final response, when the failure carries one.
    pub fn response(&self) -> Option<&TransportResponse> {
        match self {
            Self::Status { response, .. } => Some(response),
            _ => None,
        }
    }
}
