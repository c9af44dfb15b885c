//! Typed lifecycle event bus.
//!
//! One variant per event, each with a concrete payload. `emit` invokes, in
//! order: the engine-level hooks object, every plugin's hooks, then every
//! dynamic listener registered for the event. Handlers are isolated from one
//! another: a panicking handler is logged and swallowed so the rest still
//! run.

use crate::descriptor::{RequestDescriptor, RequestId};
use crate::metrics::MetricsSnapshot;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

/// A lifecycle event with its payload.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// First retry has been scheduled.
    RetryProcessStarted,
    /// A retry attempt is about to be re-issued.
    BeforeRetry(RequestDescriptor),
    /// A retry attempt's outcome is known.
    AfterRetry(RequestDescriptor, bool),
    /// A request failed terminally.
    Failure(RequestDescriptor),
    /// The last active request cleared while a retry process was running.
    RetryProcessFinished(MetricsSnapshot),
    /// Manual replay of stored failures has begun.
    ManualRetryProcessStarted,
    /// A critical request failed terminally.
    CriticalRequestFailed,
    /// The last critical request completed successfully.
    AllCriticalRequestsResolved,
    /// A request was cancelled.
    RequestCancelled(RequestId),
    /// The failed store evicted a descriptor on overflow.
    RequestRemovedFromStore(RequestDescriptor),
    /// A request failed terminally without any response.
    InternetConnectionError(RequestDescriptor),
    /// Metrics changed.
    MetricsUpdated(MetricsSnapshot),
}

impl RetryEvent {
    /// The kind of this event, for listener registration.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RetryProcessStarted => EventKind::RetryProcessStarted,
            Self::BeforeRetry(_) => EventKind::BeforeRetry,
            Self::AfterRetry(_, _) => EventKind::AfterRetry,
            Self::Failure(_) => EventKind::Failure,
            Self::RetryProcessFinished(_) => EventKind::RetryProcessFinished,
            Self::ManualRetryProcessStarted => EventKind::ManualRetryProcessStarted,
            Self::CriticalRequestFailed => EventKind::CriticalRequestFailed,
            Self::AllCriticalRequestsResolved => EventKind::AllCriticalRequestsResolved,
            Self::RequestCancelled(_) => EventKind::RequestCancelled,
            Self::RequestRemovedFromStore(_) => EventKind::RequestRemovedFromStore,
            Self::InternetConnectionError(_) => EventKind::InternetConnectionError,
            Self::MetricsUpdated(_) => EventKind::MetricsUpdated,
        }
    }
}

/// Discriminant of [`RetryEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    RetryProcessStarted,
    BeforeRetry,
    AfterRetry,
    Failure,
    RetryProcessFinished,
    ManualRetryProcessStarted,
    CriticalRequestFailed,
    AllCriticalRequestsResolved,
    RequestCancelled,
    RequestRemovedFromStore,
    InternetConnectionError,
    MetricsUpdated,
}

/// Lifecycle hooks. Every method is a no-op by default; implement the ones
/// you care about.
pub trait RetryHooks: Send + Sync {
    /// First retry has been scheduled.
    fn on_retry_process_started(&self) {}

    /// A retry attempt is about to be re-issued.
    fn before_retry(&self, descriptor: &RequestDescriptor) {
        let _ = descriptor;
    }

    /// A retry attempt's outcome is known.
    fn after_retry(&self, descriptor: &RequestDescriptor, success: bool) {
        let _ = (descriptor, success);
    }

    /// A request failed terminally.
    fn on_failure(&self, descriptor: &RequestDescriptor) {
        let _ = descriptor;
    }

    /// The last active request cleared while a retry process was running.
    fn on_retry_process_finished(&self, metrics: &MetricsSnapshot) {
        let _ = metrics;
    }

    /// Manual replay of stored failures has begun.
    fn on_manual_retry_process_started(&self) {}

    /// A critical request failed terminally.
    fn on_critical_request_failed(&self) {}

    /// The last critical request completed successfully.
    fn on_all_critical_requests_resolved(&self) {}

    /// A request was cancelled.
    fn on_request_cancelled(&self, id: &RequestId) {
        let _ = id;
    }

    /// The failed store evicted a descriptor on overflow.
    fn on_request_removed_from_store(&self, descriptor: &RequestDescriptor) {
        let _ = descriptor;
    }

    /// A request failed terminally without any response.
    fn on_internet_connection_error(&self, descriptor: &RequestDescriptor) {
        let _ = descriptor;
    }

    /// Metrics changed.
    fn on_metrics_updated(&self, metrics: &MetricsSnapshot) {
        let _ = metrics;
    }
}

fn dispatch(hooks: &dyn RetryHooks, event: &RetryEvent) {
    match event {
        RetryEvent::RetryProcessStarted => hooks.on_retry_process_started(),
        RetryEvent::BeforeRetry(d) => hooks.before_retry(d),
        RetryEvent::AfterRetry(d, success) => hooks.after_retry(d, *success),
        RetryEvent::Failure(d) => hooks.on_failure(d),
        RetryEvent::RetryProcessFinished(m) => hooks.on_retry_process_finished(m),
        RetryEvent::ManualRetryProcessStarted => hooks.on_manual_retry_process_started(),
        RetryEvent::CriticalRequestFailed => hooks.on_critical_request_failed(),
        RetryEvent::AllCriticalRequestsResolved => hooks.on_all_critical_requests_resolved(),
        RetryEvent::RequestCancelled(id) => hooks.on_request_cancelled(id),
        RetryEvent::RequestRemovedFromStore(d) => hooks.on_request_removed_from_store(d),
        RetryEvent::InternetConnectionError(d) => hooks.on_internet_connection_error(d),
        RetryEvent::MetricsUpdated(m) => hooks.on_metrics_updated(m),
    }
}

/// Dynamic listener callback.
pub type Listener = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Identifier returned by [`HookBus::on`], usable with [`HookBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct HookBusInner {
    engine_hooks: Option<Arc<dyn RetryHooks>>,
    plugin_hooks: Vec<(String, Arc<dyn RetryHooks>)>,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_listener_id: u64,
}

/// Fan-out point for lifecycle events.
#[derive(Default)]
pub struct HookBus {
    inner: Mutex<HookBusInner>,
}

impl HookBus {
    /// Create a bus with an optional engine-level hooks object.
    pub fn new(engine_hooks: Option<Arc<dyn RetryHooks>>) -> Self {
        Self {
            inner: Mutex::new(HookBusInner {
                engine_hooks,
                ..Default::default()
            }),
        }
    }

    /// Attach a plugin's hooks under its name.
    pub(crate) fn attach_plugin(&self, name: &str, hooks: Arc<dyn RetryHooks>) {
        let mut inner = self.inner.lock().expect("hook bus poisoned");
        inner.plugin_hooks.push((name.to_string(), hooks));
    }

    /// Detach a plugin's hooks by name.
    pub(crate) fn detach_plugin(&self, name: &str) {
        let mut inner = self.inner.lock().expect("hook bus poisoned");
        inner.plugin_hooks.retain(|(n, _)| n != name);
    }

    /// Register a dynamic listener for `kind`.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let mut inner = self.inner.lock().expect("hook bus poisoned");
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove a previously registered listener. Returns whether it existed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().expect("hook bus poisoned");
        for listeners in inner.listeners.values_mut() {
            if let Some(index) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(index);
                return true;
            }
        }
        false
    }

    /// Drop every dynamic listener.
    pub(crate) fn clear_listeners(&self) {
        self.inner
            .lock()
            .expect("hook bus poisoned")
            .listeners
            .clear();
    }

    /// Emit `event` to the engine hooks, plugin hooks, then listeners.
    pub fn emit(&self, event: &RetryEvent) {
        let (engine_hooks, plugin_hooks, listeners) = {
            let inner = self.inner.lock().expect("hook bus poisoned");
            (
                inner.engine_hooks.clone(),
                inner.plugin_hooks.clone(),
                inner
                    .listeners
                    .get(&event.kind())
                    .cloned()
                    .unwrap_or_default(),
            )
        };

        if let Some(hooks) = engine_hooks {
            Self::invoke("engine", event, || dispatch(hooks.as_ref(), event));
        }
        for (name, hooks) in &plugin_hooks {
            Self::invoke(name, event, || dispatch(hooks.as_ref(), event));
        }
        for (_, listener) in &listeners {
            Self::invoke("listener", event, || listener(event));
        }
    }

    fn invoke(source: &str, event: &RetryEvent, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::warn!(source, kind = ?event.kind(), "hook handler panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHooks {
        started: AtomicUsize,
    }

    impl RetryHooks for CountingHooks {
        fn on_retry_process_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emit_reaches_hooks_plugins_and_listeners_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderedHooks {
            order: Arc<Mutex<Vec<&'static str>>>,
            tag: &'static str,
        }
        impl RetryHooks for OrderedHooks {
            fn on_retry_process_started(&self) {
                self.order.lock().unwrap().push(self.tag);
            }
        }

        let bus = HookBus::new(Some(Arc::new(OrderedHooks {
            order: Arc::clone(&order),
            tag: "engine",
        })));
        bus.attach_plugin(
            "plugin-a",
            Arc::new(OrderedHooks {
                order: Arc::clone(&order),
                tag: "plugin",
            }),
        );
        let listener_order = Arc::clone(&order);
        bus.on(
            EventKind::RetryProcessStarted,
            Arc::new(move |_| listener_order.lock().unwrap().push("listener")),
        );

        bus.emit(&RetryEvent::RetryProcessStarted);
        assert_eq!(*order.lock().unwrap(), ["engine", "plugin", "listener"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let counter = Arc::new(CountingHooks {
            started: AtomicUsize::new(0),
        });
        let bus = HookBus::new(None);
        bus.attach_plugin(
            "bad",
            Arc::new({
                struct Panicking;
                impl RetryHooks for Panicking {
                    fn on_retry_process_started(&self) {
                        panic!("boom");
                    }
                }
                Panicking
            }),
        );
        bus.attach_plugin("good", Arc::clone(&counter) as Arc<dyn RetryHooks>);

        bus.emit(&RetryEvent::RetryProcessStarted);
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_only_fire_for_their_kind() {
        let bus = HookBus::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.on(
            EventKind::ManualRetryProcessStarted,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(&RetryEvent::RetryProcessStarted);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.emit(&RetryEvent::ManualRetryProcessStarted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_a_listener() {
        let bus = HookBus::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = bus.on(
            EventKind::RetryProcessStarted,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&RetryEvent::RetryProcessStarted);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
