//! Shared helpers for the lifecycle integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use retryq::transport::{
    Transport, TransportError, TransportRequest, TransportResponse, TransportResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One scripted transport outcome.
pub enum Step {
    /// Respond with this status immediately.
    Status(u16),
    /// Fail with a connection error (no response).
    Network,
    /// Wait until the gate is notified, then respond with this status.
    Gated(Arc<Notify>, u16),
}

/// Transport whose responses are scripted per URL; unscripted sends get 200.
/// Records every send in order.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Script the next responses for `url`.
    pub fn script(&self, url: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(steps);
    }

    /// URLs in the order they were sent.
    pub fn sent(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of sends so far.
    pub fn send_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &TransportRequest) -> TransportResult<TransportResponse> {
        self.log.lock().unwrap().push(request.url.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|queue| queue.pop_front());
        match step {
            None => Ok(TransportResponse::with_status(200)),
            Some(Step::Status(status)) => Ok(TransportResponse::with_status(status)),
            Some(Step::Network) => Err(TransportError::Connection("connection refused".into())),
            Some(Step::Gated(gate, status)) => {
                gate.notified().await;
                Ok(TransportResponse::with_status(status))
            }
        }
    }
}

/// Yield a few times so freshly spawned tasks reach their first await.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
