//! Failure-threshold circuit breaker wrapping the transport.
//!
//! The breaker decorates a [`Transport`], so it sits inside every retry
//! attempt the engine issues. Its fail-fast rejections surface as
//! [`TransportError::CircuitOpen`], which the engine never retries.

use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse, TransportResult};
use async_trait::async_trait;
use retryq_core::policy::StatusClass;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitMode {
    /// Requests pass; consecutive failures are counted.
    Closed,
    /// Requests fail fast until the open timeout elapses.
    Open,
    /// A bounded number of probes may pass.
    HalfOpen,
}

/// Snapshot of the breaker's state machine.
#[derive(Debug, Clone, Copy)]
pub struct CircuitState {
    /// Current position.
    pub mode: CircuitMode,
    /// Consecutive non-excluded failures observed while closed.
    pub consecutive_failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    /// Probes currently in flight while half-open.
    pub half_open_in_flight: u32,
}

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing probes.
    pub open_timeout: Duration,
    /// Maximum concurrent probes while half-open.
    pub half_open_max: u32,
    /// Response statuses that never count as failures.
    pub excluded_statuses: Vec<StatusClass>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max: 1,
            excluded_statuses: Vec::new(),
        }
    }
}

/// Transport decorator implementing the CLOSED/OPEN/HALF_OPEN state machine.
pub struct CircuitBreaker {
    inner: Arc<dyn Transport>,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    on_open: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl CircuitBreaker {
    /// Wrap `inner` with breaker behavior.
    pub fn new(inner: Arc<dyn Transport>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CircuitState {
                mode: CircuitMode::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            on_open: None,
        }
    }

    /// Register a callback fired when the circuit transitions to open.
    pub fn with_on_open(mut self, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_open = Some(callback);
        self
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitState {
        *self.state.lock().expect("circuit state poisoned")
    }

    /// Admit or fail-fast the next attempt, flipping open → half-open once
    /// the timeout has elapsed.
    fn admit(&self) -> TransportResult<()> {
        let mut state = self.state.lock().expect("circuit state poisoned");
        match state.mode {
            CircuitMode::Closed => Ok(()),
            CircuitMode::Open => {
                let opened_at = state.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() < self.config.open_timeout {
                    return Err(TransportError::CircuitOpen);
                }
                state.mode = CircuitMode::HalfOpen;
                state.half_open_in_flight = 0;
                tracing::debug!("circuit half-open, probing");
                Self::admit_probe(&mut state, self.config.half_open_max)
            }
            CircuitMode::HalfOpen => Self::admit_probe(&mut state, self.config.half_open_max),
        }
    }

    /// Admit a half-open probe, subject to the probe cap. The request that
    /// triggers the open → half-open flip counts against the cap like any
    /// other probe.
    fn admit_probe(state: &mut CircuitState, half_open_max: u32) -> TransportResult<()> {
        if state.half_open_in_flight >= half_open_max {
            return Err(TransportError::CircuitOpen);
        }
        state.half_open_in_flight += 1;
        Ok(())
    }

    fn is_failure(&self, result: &TransportResult<TransportResponse>) -> bool {
        match result {
            Err(_) => true,
            Ok(response) => {
                let status = response.status.as_u16();
                status >= 500
                    && !self
                        .config
                        .excluded_statuses
                        .iter()
                        .any(|class| class.contains(status))
            }
        }
    }

    fn record(&self, failure: bool) {
        let mut opened = false;
        {
            let mut state = self.state.lock().expect("circuit state poisoned");
            match state.mode {
                CircuitMode::Closed => {
                    if failure {
                        state.consecutive_failures += 1;
                        if state.consecutive_failures >= self.config.failure_threshold {
                            state.mode = CircuitMode::Open;
                            state.opened_at = Some(Instant::now());
                            opened = true;
                        }
                    } else {
                        state.consecutive_failures = 0;
                    }
                }
                CircuitMode::HalfOpen => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                    if failure {
                        state.mode = CircuitMode::Open;
                        state.opened_at = Some(Instant::now());
                        opened = true;
                    } else {
                        state.mode = CircuitMode::Closed;
                        state.consecutive_failures = 0;
                        state.half_open_in_flight = 0;
                        tracing::debug!("circuit closed after successful probe");
                    }
                }
                // A straggler completing after the circuit opened.
                CircuitMode::Open => {}
            }
        }
        if opened {
            tracing::warn!("circuit opened");
            if let Some(callback) = &self.on_open {
                callback();
            }
        }
    }
}

#[async_trait]
impl Transport for CircuitBreaker {
    async fn send(&self, request: &TransportRequest) -> TransportResult<TransportResponse> {
        self.admit()?;
        let result = self.inner.send(request).await;
        self.record(self.is_failure(&result));
        result
    }
}
