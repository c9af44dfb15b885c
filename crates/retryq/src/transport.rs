//! Transport contract and the default reqwest implementation.
//!
//! The engine is transport-agnostic: anything that can turn a
//! [`TransportRequest`] into a [`TransportResponse`] can sit behind it.
//! Connection pooling, TLS, and redirects are the transport's concern.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors produced below the HTTP status line.
///
/// Everything except [`CircuitOpen`](Self::CircuitOpen) is a network-class
/// failure with no response, which the engine always treats as retryable.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection could not be established or broke mid-flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport-level timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// Synthetic fail-fast failure from an open circuit breaker.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The request could not be built or sent for another reason.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this failure is the circuit breaker refusing to try at all.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// An HTTP request as the engine hands it to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,

    /// Request URL.
    pub url: String,

    /// Request headers.
    pub headers: HeaderMap,

    /// Request body (optional).
    pub body: Option<Bytes>,
}

impl TransportRequest {
    /// Create a new request.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Convenience constructor for a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Convenience constructor for a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header to the request.
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn with_json<T: serde::Serialize>(
        mut self,
        value: &T,
    ) -> TransportResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| TransportError::Other(format!("JSON body serialization: {e}")))?;
        self.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(body));
        Ok(self)
    }
}

/// An HTTP response as the transport hands it back to the engine.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Create a new response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Shorthand for a bodiless response with `status`.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The response body as UTF-8 text.
    pub fn text(&self) -> std::result::Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }

    /// Parse the response body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::Other(format!("JSON body deserialization: {e}")))
    }
}

/// The transport seam the engine drives.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return the response or a transport failure.
    ///
    /// A non-2xx status is a response, not an error; classification is the
    /// engine's job.
    async fn send(&self, request: &TransportRequest) -> TransportResult<TransportResponse>;
}

/// reqwest-backed transport.
///
/// Handles connection pooling, TLS, and timeouts; retries, queueing, and
/// circuit breaking all live above it.
#[derive(Clone)]
pub struct HttpTransport {
    client: Arc<reqwest::Client>,
}

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Per-request timeout.
    pub timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Maximum idle connections per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpTransport {
    /// Create a transport with default configuration.
    pub fn new() -> TransportResult<Self> {
        Self::with_config(HttpTransportConfig::default())
    }

    /// Create a transport with custom configuration.
    pub fn with_config(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> TransportResult<TransportResponse> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| TransportError::Other(format!("invalid URL {}: {e}", request.url)))?;

        let mut req = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse::new(status, headers, body))
    }
}
