//! Request/response interception seam for plugins.

use crate::transport::{TransportRequest, TransportResponse, TransportResult};
use async_trait::async_trait;

/// Processing hook around the transport.
///
/// Both methods default to pass-through; implement the side you need.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process a request before it is sent.
    async fn process_request(&self, request: TransportRequest) -> TransportResult<TransportRequest> {
        Ok(request)
    }

    /// Process a response after it is received.
    async fn process_response(
        &self,
        response: TransportResponse,
    ) -> TransportResult<TransportResponse> {
        Ok(response)
    }
}

/// Middleware that logs requests and responses.
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn process_request(&self, request: TransportRequest) -> TransportResult<TransportRequest> {
        tracing::debug!(method = %request.method, url = %request.url, "sending request");
        Ok(request)
    }

    async fn process_response(
        &self,
        response: TransportResponse,
    ) -> TransportResult<TransportResponse> {
        tracing::debug!(status = %response.status, "received response");
        Ok(response)
    }
}
