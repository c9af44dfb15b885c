//! The request lifecycle engine.
//!
//! One engine instance owns the admission controller, the timer registry,
//! the failed-request store, metrics, and the hook bus. Each logical request
//! is driven by exactly one task (the caller's future), which re-enters
//! admission on every retry attempt so preemption and queue-full pushback
//! apply to retries too.
//!
//! Locking: `EngineState` sits behind one mutex that is never held across an
//! await; lifecycle events are collected under the lock and emitted after it
//! is released, preserving causal order per request. The admission
//! controller's critical probe reads an atomic counter, so admission never
//! re-enters the engine lock.

use crate::admission::{
    ActiveCriticalProbe, AdmissionConfig, AdmissionController, AdmissionError, CriticalPredicate,
};
use crate::config::EngineConfig;
use crate::descriptor::{RequestDescriptor, RequestId, RequestOptions, RetryMode};
use crate::error::{Result, RetryError};
use crate::hooks::{EventKind, HookBus, Listener, ListenerId, RetryEvent, RetryHooks};
use crate::metrics::{ErrorKind, Metrics, MetricsSnapshot, TimerHealth};
use crate::plugin::{self, MiddlewarePlacement, PluginOptions, RegisteredPlugin, RetryPlugin};
use crate::queue::QueueTicket;
use crate::store::FailedStore;
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse, TransportResult};
use crate::middleware::Middleware;
use retryq_core::policy::RetryPolicy;
use retryq_core::timer::{TimerOutcome, TimerRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Cancellation capability of one logical request.
#[derive(Debug, Clone)]
struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn cancel(&self) {
        self.tx.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot error.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct ActiveEntry {
    descriptor: RequestDescriptor,
    cancel: CancelFlag,
}

struct EngineState {
    active: HashMap<RequestId, ActiveEntry>,
    retry_timers: HashMap<RequestId, retryq_core::timer::TimerHandle>,
    store: FailedStore,
    metrics: Metrics,
    in_retry_progress: bool,
}

struct EngineInner {
    config: EngineConfig,
    policy: RetryPolicy,
    timers: TimerRegistry,
    admission: AdmissionController,
    transport: Arc<dyn Transport>,
    hooks: HookBus,
    plugins: Mutex<Vec<RegisteredPlugin>>,
    state: Mutex<EngineState>,
    critical_active: Arc<AtomicUsize>,
    id_counter: AtomicU64,
    destroyed: AtomicBool,
}

/// A failed transport attempt.
enum AttemptFailure {
    /// The transport produced a response with a failure status.
    Response(TransportResponse),
    /// The transport produced no response.
    Transport(TransportError),
}

enum FailureVerdict {
    Retry,
    Terminal,
}

enum SleepVerdict {
    Proceed,
    Cancelled,
}

/// Client-side retry and admission-control engine.
///
/// Cloning is cheap; clones share one engine.
///
/// # Example
///
/// ```rust,no_run
/// use retryq::prelude::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), retryq::RetryError> {
/// let transport = Arc::new(HttpTransport::new().expect("transport"));
/// let engine = RetryEngine::new(transport, EngineConfig::default())?;
///
/// let response = engine
///     .execute(TransportRequest::get("https://api.example.com/items"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RetryEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`RetryEngine`].
#[derive(Default)]
pub struct RetryEngineBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: Option<EngineConfig>,
    hooks: Option<Arc<dyn RetryHooks>>,
}

impl RetryEngineBuilder {
    /// Set the transport the engine drives. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the engine configuration. Default: [`EngineConfig::default`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach an engine-level hooks object.
    pub fn hooks(mut self, hooks: Arc<dyn RetryHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Fails when no transport was supplied or the configuration is invalid
    /// (e.g. `max_concurrent_requests < 1`).
    pub fn build(self) -> Result<RetryEngine> {
        let transport = self
            .transport
            .ok_or_else(|| RetryError::Config("a transport is required".to_string()))?;
        RetryEngine::with_parts(transport, self.config.unwrap_or_default(), self.hooks)
    }
}

impl RetryEngine {
    /// Create an engine over `transport` with `config`.
    ///
    /// # Errors
    ///
    /// Fails when `config.max_concurrent_requests < 1`.
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self> {
        Self::with_parts(transport, config, None)
    }

    /// Start building an engine.
    pub fn builder() -> RetryEngineBuilder {
        RetryEngineBuilder::default()
    }

    fn with_parts(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        hooks: Option<Arc<dyn RetryHooks>>,
    ) -> Result<Self> {
        let policy = RetryPolicy::new(
            config.retryable_statuses.clone(),
            config.retryable_methods.clone(),
            config.backoff,
            config.idempotency_headers.clone(),
        );
        let timers = TimerRegistry::new();
        let critical_active = Arc::new(AtomicUsize::new(0));

        let threshold = config.blocking_queue_threshold;
        let is_critical: CriticalPredicate = Arc::new(move |ticket: &QueueTicket| {
            threshold.is_some_and(|t| ticket.priority >= t)
        });
        let probe_counter = Arc::clone(&critical_active);
        let has_active_critical: ActiveCriticalProbe =
            Arc::new(move || probe_counter.load(Ordering::SeqCst) > 0);

        let admission = AdmissionController::new(
            AdmissionConfig {
                max_concurrent: config.max_concurrent_requests,
                queue_delay: config.queue_delay,
                max_queue_size: config.max_queue_size,
            },
            timers.clone(),
            is_critical,
            has_active_critical,
        )
        .map_err(|e| RetryError::Config(e.to_string()))?;

        let store = FailedStore::new(config.max_requests_to_store);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                policy,
                timers,
                admission,
                transport,
                hooks: HookBus::new(hooks),
                plugins: Mutex::new(Vec::new()),
                state: Mutex::new(EngineState {
                    active: HashMap::new(),
                    retry_timers: HashMap::new(),
                    store,
                    metrics: Metrics::default(),
                    in_retry_progress: false,
                }),
                critical_active,
                id_counter: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    // ---------------------------------------------------------------- public

    /// Run one logical request through the full lifecycle: admission,
    /// transport, automatic retries, terminal bookkeeping.
    ///
    /// Returns `Ok(Some(response))` on success, `Ok(None)` on a terminal
    /// failure or cancellation that the configuration resolves silently
    /// (`throw_error_on_failed_retries` / `throw_error_on_cancel_request`
    /// disabled), and `Err` otherwise.
    pub async fn execute(&self, options: impl Into<RequestOptions>) -> Result<Option<TransportResponse>> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(RetryError::QueueDestroyed);
        }
        let options = options.into();
        let mut descriptor = self.new_descriptor(options);
        let id = descriptor.id.clone();

        let outer = self.middlewares(MiddlewarePlacement::Outer);
        for middleware in &outer {
            descriptor.request = middleware
                .process_request(descriptor.request.clone())
                .await
                .map_err(|source| RetryError::Transport {
                    id: id.clone(),
                    source,
                })?;
        }

        let result = self.drive(descriptor, CancelFlag::new(), false).await;

        match result {
            Ok(Some(mut response)) => {
                for middleware in outer.iter().rev() {
                    response = middleware
                        .process_response(response)
                        .await
                        .map_err(|source| RetryError::Transport {
                            id: id.clone(),
                            source,
                        })?;
                }
                Ok(Some(response))
            }
            other => other,
        }
    }

    /// Drain the failed store and replay every entry through the retry path.
    ///
    /// Results come back in store order (oldest first).
    pub async fn retry_failed_requests(&self) -> Vec<Result<Option<TransportResponse>>> {
        let drained = {
            let mut state = self.lock_state();
            state.store.drain_all()
        };
        if drained.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = drained.len(), "manual replay started");
        self.inner.hooks.emit(&RetryEvent::ManualRetryProcessStarted);

        let replays = drained.into_iter().map(|mut descriptor| {
            descriptor.attempt = 1;
            descriptor.retrying = false;
            let engine = self.clone();
            async move { engine.drive(descriptor, CancelFlag::new(), true).await }
        });
        futures::future::join_all(replays).await
    }

    /// Cancel the request with `id`: abort its transport call, remove it
    /// from the queue, and cancel any pending retry sleep. Synchronous and
    /// idempotent. Returns whether anything was cancelled.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        let mut events = Vec::new();
        let mut found = false;
        {
            let mut state = self.lock_state();
            if let Some(entry) = self.remove_active(&mut state, id) {
                entry.cancel.cancel();
                state.metrics.canceled_requests += 1;
                state.metrics.error_kinds.record(ErrorKind::Cancelled);
                events.push(RetryEvent::RequestCancelled(id.clone()));
                found = true;
            }
            if let Some(timer) = state.retry_timers.remove(id) {
                timer.cancel();
                found = true;
            }
            if found {
                events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
                events.extend(self.finalize_if_idle(&mut state));
            }
        }
        let queued = self.inner.admission.cancel_queued(id);
        self.emit_all(events);
        found || queued
    }

    /// Cancel every known request. Order is unspecified.
    pub fn cancel_all_requests(&self) {
        let ids: Vec<RequestId> = {
            let state = self.lock_state();
            state
                .active
                .keys()
                .chain(state.retry_timers.keys())
                .cloned()
                .collect()
        };
        for id in ids {
            self.cancel_request(&id);
        }
        // Requests waiting in queue but momentarily absent from the maps.
        for ticket in self.inner.admission.queue_snapshot() {
            self.inner.admission.cancel_queued(&ticket.id);
        }
    }

    /// A metrics snapshot at this instant.
    pub fn metrics(&self) -> MetricsSnapshot {
        let state = self.lock_state();
        self.snapshot_locked(&state)
    }

    /// Copies of every descriptor currently in the failed store.
    pub fn failed_requests(&self) -> Vec<RequestDescriptor> {
        self.lock_state().store.get_all()
    }

    /// Number of active logical requests (queued, in flight, or sleeping).
    pub fn active_request_count(&self) -> usize {
        self.lock_state().active.len()
    }

    /// Number of requests waiting in the admission queue.
    pub fn queued_request_count(&self) -> usize {
        self.inner.admission.queue_len()
    }

    /// Number of requests currently holding an admission slot.
    pub fn in_flight_count(&self) -> usize {
        self.inner.admission.in_flight()
    }

    /// Queued tickets in admission order, for diagnostics.
    pub fn queue_snapshot(&self) -> Vec<QueueTicket> {
        self.inner.admission.queue_snapshot()
    }

    /// Register a dynamic listener for `kind`.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.inner.hooks.on(kind, listener)
    }

    /// Remove a previously registered listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.hooks.off(id)
    }

    /// Attach a plugin.
    ///
    /// # Errors
    ///
    /// Fails when the version does not match `X.Y.Z` or the name is already
    /// registered.
    pub fn register_plugin(
        &self,
        plugin: Arc<dyn RetryPlugin>,
        options: PluginOptions,
    ) -> Result<()> {
        {
            let plugins = self.inner.plugins.lock().expect("plugins poisoned");
            let names: Vec<String> = plugins
                .iter()
                .map(|p| p.plugin.name().to_string())
                .collect();
            plugin::validate_registration(plugin.as_ref(), &names).map_err(RetryError::Plugin)?;
        }
        plugin.initialize(self);
        if let Some(hooks) = plugin.hooks() {
            self.inner.hooks.attach_plugin(plugin.name(), hooks);
        }
        tracing::debug!(name = plugin.name(), version = plugin.version(), "plugin registered");
        self.inner
            .plugins
            .lock()
            .expect("plugins poisoned")
            .push(RegisteredPlugin {
                plugin,
                placement: options.placement,
            });
        Ok(())
    }

    /// Detach the plugin named `name`, running its `on_before_destroyed`
    /// first. Returns whether it was registered.
    pub fn unregister_plugin(&self, name: &str) -> bool {
        let plugin = {
            let plugins = self.inner.plugins.lock().expect("plugins poisoned");
            plugins
                .iter()
                .find(|p| p.plugin.name() == name)
                .map(|p| Arc::clone(&p.plugin))
        };
        let Some(plugin) = plugin else {
            return false;
        };
        plugin.on_before_destroyed(self);
        self.inner
            .plugins
            .lock()
            .expect("plugins poisoned")
            .retain(|p| p.plugin.name() != name);
        self.inner.hooks.detach_plugin(name);
        true
    }

    /// Tear the engine down: cancel every request and retry sleep, destroy
    /// the admission queue, shut the timer registry down, notify plugins,
    /// and drop all listeners. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_all_requests();
        self.inner.admission.destroy();
        self.inner.timers.shutdown();
        let plugins: Vec<Arc<dyn RetryPlugin>> = {
            let plugins = self.inner.plugins.lock().expect("plugins poisoned");
            plugins.iter().map(|p| Arc::clone(&p.plugin)).collect()
        };
        for plugin in plugins {
            plugin.on_before_destroyed(self);
        }
        self.inner.hooks.clear_listeners();
        tracing::debug!("retry engine destroyed");
    }

    // ---------------------------------------------------------------- driver

    /// Drive one logical request to a terminal outcome. `pending_retry`
    /// enters through the retry sleep first (manual replay).
    async fn drive(
        &self,
        mut descriptor: RequestDescriptor,
        cancel: CancelFlag,
        mut pending_retry: bool,
    ) -> Result<Option<TransportResponse>> {
        let inner = &self.inner;
        loop {
            if pending_retry {
                pending_retry = false;
                match self.retry_sleep(&mut descriptor, &cancel).await {
                    SleepVerdict::Proceed => {}
                    SleepVerdict::Cancelled => return self.cancel_result(&descriptor.id),
                }
            }

            // Request entry: register the attempt and count it.
            {
                let mut state = self.lock_state();
                state.metrics.total_requests += 1;
                *state
                    .metrics
                    .requests_by_priority
                    .entry(descriptor.priority)
                    .or_default() += 1;
                self.insert_active(&mut state, descriptor.clone(), cancel.clone());
                let snapshot = self.snapshot_locked(&state);
                drop(state);
                inner.hooks.emit(&RetryEvent::MetricsUpdated(snapshot));
            }
            if inner.config.debug {
                tracing::debug!(id = %descriptor.id, attempt = descriptor.attempt, "request entering admission");
            }

            // Admission.
            let ticket = QueueTicket {
                id: descriptor.id.clone(),
                priority: descriptor.priority,
                timestamp_ms: descriptor.timestamp_ms,
            };
            let wait_start = tokio::time::Instant::now();
            let waiter = match inner.admission.enqueue(ticket) {
                Ok(waiter) => waiter,
                Err(AdmissionError::QueueFull { .. }) => {
                    let mut state = self.lock_state();
                    self.remove_active(&mut state, &descriptor.id);
                    drop(state);
                    // Propagated to the caller unchanged; never retried.
                    return Err(RetryError::QueueFull {
                        descriptor: Box::new(descriptor),
                    });
                }
                Err(_) => {
                    let mut state = self.lock_state();
                    self.remove_active(&mut state, &descriptor.id);
                    drop(state);
                    return Err(RetryError::QueueDestroyed);
                }
            };

            let admitted = tokio::select! {
                biased;
                result = waiter.admitted() => result,
                _ = cancel.cancelled() => Err(AdmissionError::Canceled {
                    id: descriptor.id.clone(),
                }),
            };

            match admitted {
                Ok(_) => {
                    let mut state = self.lock_state();
                    state.metrics.queue_wait_total += wait_start.elapsed();
                }
                Err(AdmissionError::Canceled { .. }) => {
                    return self.conclude_cancelled_in_queue(descriptor);
                }
                Err(AdmissionError::QueueCleared) => {
                    return self.conclude_shutdown(&descriptor, RetryError::QueueCleared);
                }
                Err(_) => {
                    return self.conclude_shutdown(&descriptor, RetryError::QueueDestroyed);
                }
            }

            // Transport attempt, with inner plugin middleware around it.
            let outcome = tokio::select! {
                biased;
                result = self.send_with_middleware(&descriptor.request) => Some(result),
                _ = cancel.cancelled() => None,
            };
            inner.admission.mark_complete();

            let failure = match outcome {
                None => return self.conclude_aborted_in_flight(&descriptor),
                Some(Ok(response)) if response.status.as_u16() < 400 => {
                    return self.conclude_success(descriptor, response);
                }
                Some(Ok(response)) => AttemptFailure::Response(response),
                Some(Err(error)) => AttemptFailure::Transport(error),
            };

            match self.after_failure(&mut descriptor, &failure) {
                FailureVerdict::Retry => pending_retry = true,
                FailureVerdict::Terminal => {
                    return self.conclude_terminal_failure(descriptor, failure);
                }
            }
        }
    }

    /// Run the inner middleware chain around one transport call.
    async fn send_with_middleware(
        &self,
        request: &TransportRequest,
    ) -> TransportResult<TransportResponse> {
        let middlewares = self.middlewares(MiddlewarePlacement::Inner);
        let mut request = request.clone();
        for middleware in &middlewares {
            request = middleware.process_request(request).await?;
        }
        let mut response = self.inner.transport.send(&request).await?;
        for middleware in middlewares.iter().rev() {
            response = middleware.process_response(response).await?;
        }
        Ok(response)
    }

    /// Mark the descriptor retrying, sleep under a cancellable timer, then
    /// do the pre-retry bookkeeping.
    async fn retry_sleep(
        &self,
        descriptor: &mut RequestDescriptor,
        cancel: &CancelFlag,
    ) -> SleepVerdict {
        let inner = &self.inner;
        let mut events = Vec::new();
        let (delay, sleep) = {
            let mut state = self.lock_state();
            if !state.in_retry_progress {
                state.in_retry_progress = true;
                events.push(RetryEvent::RetryProcessStarted);
            }
            descriptor.retrying = true;
            if let Some(entry) = state.active.get_mut(&descriptor.id) {
                entry.descriptor = descriptor.clone();
            }
            let delay = inner.policy.delay(descriptor.attempt, descriptor.backoff);
            let sleep = inner.timers.sleep(delay);
            state
                .retry_timers
                .insert(descriptor.id.clone(), sleep.handle());
            (delay, sleep)
        };
        self.emit_all(events);
        if inner.config.debug {
            tracing::debug!(id = %descriptor.id, attempt = descriptor.attempt, ?delay, "retry scheduled");
        }

        let outcome = sleep.wait().await;
        let cancelled = outcome == TimerOutcome::Cancelled || cancel.is_cancelled();

        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            state.retry_timers.remove(&descriptor.id);
            state.metrics.retry_delay_total += delay;
            if cancelled {
                let was_active = self.remove_active(&mut state, &descriptor.id).is_some();
                if was_active && !cancel.is_cancelled() {
                    // Cancelled by registry shutdown rather than
                    // cancel_request, which would have done this itself.
                    state.metrics.canceled_requests += 1;
                    state.metrics.error_kinds.record(ErrorKind::Cancelled);
                    events.push(RetryEvent::RequestCancelled(descriptor.id.clone()));
                }
                events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
                events.extend(self.finalize_if_idle(&mut state));
            } else {
                *state
                    .metrics
                    .retry_attempts_distribution
                    .entry(descriptor.attempt)
                    .or_default() += 1;
                *state
                    .metrics
                    .retries_by_priority
                    .entry(descriptor.priority)
                    .or_default() += 1;
                events.push(RetryEvent::BeforeRetry(descriptor.clone()));
                events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            }
        }
        self.emit_all(events);

        if cancelled {
            SleepVerdict::Cancelled
        } else {
            SleepVerdict::Proceed
        }
    }

    /// Classify a failed attempt and decide retry vs. terminal.
    fn after_failure(
        &self,
        descriptor: &mut RequestDescriptor,
        failure: &AttemptFailure,
    ) -> FailureVerdict {
        let mut events = Vec::new();
        let verdict = {
            let mut state = self.lock_state();
            if descriptor.retrying {
                state.metrics.failed_retries += 1;
                state.metrics.error_kinds.record(classify(failure));
                state
                    .metrics
                    .priority_outcomes
                    .entry(descriptor.priority)
                    .or_default()
                    .failures += 1;
                events.push(RetryEvent::AfterRetry(descriptor.clone(), false));
                events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            }

            let attempt = descriptor.attempt + 1;
            let max = descriptor.effective_max_attempts(self.inner.config.retries);
            let mode = descriptor.effective_mode(self.inner.config.mode);
            let retryable = self.failure_is_retryable(descriptor, failure);

            if mode == RetryMode::Automatic && retryable && attempt <= max {
                descriptor.attempt = attempt;
                if let Some(entry) = state.active.get_mut(&descriptor.id) {
                    entry.descriptor = descriptor.clone();
                }
                FailureVerdict::Retry
            } else {
                FailureVerdict::Terminal
            }
        };
        self.emit_all(events);
        verdict
    }

    // ----------------------------------------------------------- conclusions

    fn conclude_success(
        &self,
        mut descriptor: RequestDescriptor,
        response: TransportResponse,
    ) -> Result<Option<TransportResponse>> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            self.remove_active(&mut state, &descriptor.id);
            if descriptor.retrying {
                state.metrics.successful_retries += 1;
                state
                    .metrics
                    .priority_outcomes
                    .entry(descriptor.priority)
                    .or_default()
                    .successes += 1;
                events.push(RetryEvent::AfterRetry(descriptor.clone(), true));
                descriptor.retrying = false;
            }
            if self.is_critical(&descriptor)
                && self.inner.critical_active.load(Ordering::SeqCst) == 0
            {
                events.push(RetryEvent::AllCriticalRequestsResolved);
            }
            events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            events.extend(self.finalize_if_idle(&mut state));
        }
        self.emit_all(events);
        if self.inner.config.debug {
            tracing::debug!(id = %descriptor.id, status = %response.status, "request succeeded");
        }
        Ok(Some(response))
    }

    fn conclude_terminal_failure(
        &self,
        mut descriptor: RequestDescriptor,
        failure: AttemptFailure,
    ) -> Result<Option<TransportResponse>> {
        let retryable = self.failure_is_retryable(&descriptor, &failure);
        let critical = self.is_critical(&descriptor);
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            descriptor.retrying = false;
            events.push(RetryEvent::Failure(descriptor.clone()));
            if retryable {
                // The retry loop exhausted attempts on a retryable error:
                // keep it for manual replay.
                if let Some(evicted) = state.store.add(descriptor.clone()) {
                    events.push(RetryEvent::RequestRemovedFromStore(evicted));
                }
            }
            self.remove_active(&mut state, &descriptor.id);
            if matches!(&failure, AttemptFailure::Transport(_)) {
                // No response exists, circuit-open rejections included.
                events.push(RetryEvent::InternetConnectionError(descriptor.clone()));
            }
            if critical {
                events.push(RetryEvent::CriticalRequestFailed);
            }
            events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            events.extend(self.finalize_if_idle(&mut state));
        }
        self.emit_all(events);

        if critical {
            // Every queued request becomes a cancelled-in-queue failure.
            for ticket in self.inner.admission.queue_snapshot() {
                self.inner.admission.cancel_queued(&ticket.id);
            }
        }

        tracing::debug!(id = %descriptor.id, "request failed terminally");
        if !self.inner.config.throw_error_on_failed_retries {
            return Ok(None);
        }
        Err(match failure {
            AttemptFailure::Transport(TransportError::CircuitOpen) => RetryError::CircuitOpen,
            AttemptFailure::Transport(source) => RetryError::Transport {
                id: descriptor.id,
                source,
            },
            AttemptFailure::Response(response) => RetryError::Status {
                id: descriptor.id,
                response: Box::new(response),
            },
        })
    }

    fn conclude_cancelled_in_queue(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<Option<TransportResponse>> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            if self.remove_active(&mut state, &descriptor.id).is_some() {
                // Cancelled by a queue cascade rather than cancel_request:
                // the bookkeeping falls to us, and the request is a replay
                // candidate.
                state.metrics.canceled_requests += 1;
                state.metrics.error_kinds.record(ErrorKind::Cancelled);
                if let Some(evicted) = state.store.add(descriptor.clone()) {
                    events.push(RetryEvent::RequestRemovedFromStore(evicted));
                }
                events.push(RetryEvent::RequestCancelled(descriptor.id.clone()));
            }
            events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            events.extend(self.finalize_if_idle(&mut state));
        }
        self.emit_all(events);
        self.cancel_result(&descriptor.id)
    }

    fn conclude_aborted_in_flight(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<Option<TransportResponse>> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            if self.remove_active(&mut state, &descriptor.id).is_some() {
                // Cancelled by something that bypassed cancel_request.
                state.metrics.canceled_requests += 1;
                state.metrics.error_kinds.record(ErrorKind::Cancelled);
                events.push(RetryEvent::RequestCancelled(descriptor.id.clone()));
            }
            events.push(RetryEvent::MetricsUpdated(self.snapshot_locked(&state)));
            events.extend(self.finalize_if_idle(&mut state));
        }
        self.emit_all(events);
        self.cancel_result(&descriptor.id)
    }

    fn conclude_shutdown(
        &self,
        descriptor: &RequestDescriptor,
        error: RetryError,
    ) -> Result<Option<TransportResponse>> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            if self.remove_active(&mut state, &descriptor.id).is_some() {
                state.metrics.canceled_requests += 1;
                state.metrics.error_kinds.record(ErrorKind::Cancelled);
            }
            events.extend(self.finalize_if_idle(&mut state));
        }
        self.emit_all(events);
        Err(error)
    }

    // -------------------------------------------------------------- internal

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().expect("engine state poisoned")
    }

    fn new_descriptor(&self, options: RequestOptions) -> RequestDescriptor {
        let id = options
            .id
            .unwrap_or_else(|| RequestId::generate(&options.request.url, &self.inner.id_counter));
        let timestamp_ms = options
            .timestamp_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        RequestDescriptor {
            id,
            priority: options.priority,
            timestamp_ms,
            attempt: 0,
            max_attempts: options.max_attempts,
            mode: options.mode,
            retryable_statuses: options.retryable_statuses,
            backoff: options.backoff,
            retrying: false,
            request: options.request,
        }
    }

    fn is_critical(&self, descriptor: &RequestDescriptor) -> bool {
        self.inner.config.is_critical(descriptor.priority)
    }

    fn insert_active(
        &self,
        state: &mut EngineState,
        descriptor: RequestDescriptor,
        cancel: CancelFlag,
    ) {
        let critical = self.is_critical(&descriptor);
        let id = descriptor.id.clone();
        let previous = state.active.insert(id, ActiveEntry { descriptor, cancel });
        if critical && previous.is_none() {
            self.inner.critical_active.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remove_active(&self, state: &mut EngineState, id: &RequestId) -> Option<ActiveEntry> {
        let entry = state.active.remove(id)?;
        if self.inner.config.is_critical(entry.descriptor.priority) {
            self.inner.critical_active.fetch_sub(1, Ordering::SeqCst);
        }
        Some(entry)
    }

    fn failure_is_retryable(
        &self,
        descriptor: &RequestDescriptor,
        failure: &AttemptFailure,
    ) -> bool {
        match failure {
            AttemptFailure::Transport(TransportError::CircuitOpen) => false,
            AttemptFailure::Transport(_) => true,
            AttemptFailure::Response(response) => self.inner.policy.is_retryable_response(
                &descriptor.request.method,
                response.status.as_u16(),
                &descriptor.request.headers,
                descriptor.retryable_statuses.as_deref(),
            ),
        }
    }

    /// When the last active request clears during a retry process, fold the
    /// store into the completely-failed counters and finish the process.
    fn finalize_if_idle(&self, state: &mut EngineState) -> Vec<RetryEvent> {
        if !state.in_retry_progress || !state.active.is_empty() {
            return Vec::new();
        }
        state.in_retry_progress = false;
        let entries = state.store.get_all();
        state.metrics.completely_failed_requests += entries.len() as u64;
        state.metrics.completely_failed_critical_requests += entries
            .iter()
            .filter(|d| self.inner.config.is_critical(d.priority))
            .count() as u64;
        vec![RetryEvent::RetryProcessFinished(self.snapshot_locked(state))]
    }

    fn snapshot_locked(&self, state: &EngineState) -> MetricsSnapshot {
        let active_timers = self.inner.timers.active_count();
        let active_retry_timers = state.retry_timers.len();
        state.metrics.snapshot(TimerHealth {
            active_timers,
            active_retry_timers,
            health_score: active_timers + 2 * active_retry_timers,
        })
    }

    fn cancel_result(&self, id: &RequestId) -> Result<Option<TransportResponse>> {
        if self.inner.config.throw_error_on_cancel_request {
            Err(RetryError::Aborted { id: id.clone() })
        } else {
            Ok(None)
        }
    }

    fn middlewares(&self, placement: MiddlewarePlacement) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .plugins
            .lock()
            .expect("plugins poisoned")
            .iter()
            .filter(|p| p.placement == placement)
            .filter_map(|p| p.plugin.middleware())
            .collect()
    }

    fn emit_all(&self, events: Vec<RetryEvent>) {
        for event in events {
            self.inner.hooks.emit(&event);
        }
    }
}

fn classify(failure: &AttemptFailure) -> ErrorKind {
    match failure {
        AttemptFailure::Transport(_) => ErrorKind::Network,
        AttemptFailure::Response(response) if response.status.as_u16() >= 500 => {
            ErrorKind::Server5xx
        }
        AttemptFailure::Response(_) => ErrorKind::Client4xx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use http::Method;

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn send(&self, _request: &TransportRequest) -> TransportResult<TransportResponse> {
            Ok(TransportResponse::with_status(200))
        }
    }

    fn engine_with(config: EngineConfig) -> RetryEngine {
        RetryEngine::new(Arc::new(OkTransport), config).expect("engine builds")
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = EngineConfig::builder().max_concurrent_requests(0).build();
        assert!(matches!(
            RetryEngine::new(Arc::new(OkTransport), config),
            Err(RetryError::Config(_))
        ));
    }

    #[test]
    fn builder_requires_a_transport() {
        assert!(matches!(
            RetryEngine::builder().build(),
            Err(RetryError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_returns_the_response() {
        let engine = engine_with(EngineConfig::default());
        let response = engine
            .execute(TransportRequest::new(Method::GET, "https://example.com/ok"))
            .await
            .unwrap()
            .expect("throw-on-failure default returns Some");
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(engine.active_request_count(), 0);
        assert_eq!(engine.metrics().total_requests, 1);
    }

    #[test]
    fn plugin_registration_validates_version_and_name() {
        struct NamedPlugin {
            name: &'static str,
            version: &'static str,
        }
        impl RetryPlugin for NamedPlugin {
            fn name(&self) -> &str {
                self.name
            }
            fn version(&self) -> &str {
                self.version
            }
        }

        let engine = engine_with(EngineConfig::default());
        assert!(matches!(
            engine.register_plugin(
                Arc::new(NamedPlugin {
                    name: "cache",
                    version: "not-semver",
                }),
                PluginOptions::default(),
            ),
            Err(RetryError::Plugin(_))
        ));

        engine
            .register_plugin(
                Arc::new(NamedPlugin {
                    name: "cache",
                    version: "1.0.0",
                }),
                PluginOptions::default(),
            )
            .unwrap();

        assert!(matches!(
            engine.register_plugin(
                Arc::new(NamedPlugin {
                    name: "cache",
                    version: "2.0.0",
                }),
                PluginOptions::default(),
            ),
            Err(RetryError::Plugin(_))
        ));

        assert!(engine.unregister_plugin("cache"));
        assert!(!engine.unregister_plugin("cache"));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_after_destroy_is_rejected() {
        let engine = engine_with(EngineConfig::default());
        engine.destroy();
        assert!(matches!(
            engine
                .execute(TransportRequest::new(Method::GET, "https://example.com"))
                .await,
            Err(RetryError::QueueDestroyed)
        ));
    }
}
