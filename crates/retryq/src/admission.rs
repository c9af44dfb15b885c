//! Bounded-concurrency admission control with priority scheduling.
//!
//! Requests wait in the [`PriorityQueue`] until a dequeue tick admits them.
//! At most one dequeue timer is pending at a time; every enqueue or
//! completion coalesces into a fresh tick after `queue_delay`. The tick
//! admits from the top of the queue while capacity remains, stopping at the
//! first non-critical item whenever a critical request is active.

use crate::descriptor::RequestId;
use crate::queue::{PriorityQueue, QueueTicket};
use retryq_core::timer::{TimerHandle, TimerOutcome, TimerRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Rejections produced by the admission queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The queue is at `max_queue_size`; the request was never enqueued.
    #[error("Request queue is full; request {id} was rejected")]
    QueueFull {
        /// Id of the rejected request.
        id: RequestId,
    },

    /// The queued request was cancelled before admission.
    #[error("Request aborted. ID: {id}")]
    Canceled {
        /// Id of the cancelled request.
        id: RequestId,
    },

    /// The queue was cleared while this request was waiting.
    #[error("request queue was cleared")]
    QueueCleared,

    /// The queue was destroyed.
    #[error("request queue was destroyed")]
    QueueDestroyed,

    /// Constructor rejected the concurrency bound.
    #[error("max_concurrent must be at least 1 (got {value})")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },
}

/// Predicate telling the controller whether a queued item is critical.
pub type CriticalPredicate = Arc<dyn Fn(&QueueTicket) -> bool + Send + Sync>;

/// Probe telling the controller whether any active request is critical.
pub type ActiveCriticalProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Configuration for [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum concurrently admitted requests. Must be at least 1.
    pub max_concurrent: usize,
    /// Delay of the coalesced dequeue tick. Zero still defers by one tick.
    pub queue_delay: Duration,
    /// Optional bound on queue length; `enqueue` beyond it fails
    /// synchronously.
    pub max_queue_size: Option<usize>,
}

type Waiter = oneshot::Sender<Result<QueueTicket, AdmissionError>>;

struct AdmissionState {
    in_flight: usize,
    queue: PriorityQueue<Waiter>,
    pending_dequeue: Option<TimerHandle>,
    destroyed: bool,
}

struct AdmissionShared {
    config: AdmissionConfig,
    timers: TimerRegistry,
    is_critical: CriticalPredicate,
    has_active_critical: ActiveCriticalProbe,
    state: Mutex<AdmissionState>,
}

/// Admission queue enforcing `max_concurrent`, queue delay, and critical
/// preemption.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<AdmissionShared>,
}

/// Pending admission returned by [`AdmissionController::enqueue`].
#[derive(Debug)]
pub struct AdmissionWaiter {
    rx: oneshot::Receiver<Result<QueueTicket, AdmissionError>>,
}

impl AdmissionWaiter {
    /// Resolve once the request is admitted, or with the rejection that
    /// removed it from the queue.
    pub async fn admitted(self) -> Result<QueueTicket, AdmissionError> {
        match self.rx.await {
            Ok(result) => result,
            // Waiter dropped without resolution only happens on teardown.
            Err(_) => Err(AdmissionError::QueueDestroyed),
        }
    }
}

impl AdmissionController {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Rejects `max_concurrent < 1`.
    pub fn new(
        config: AdmissionConfig,
        timers: TimerRegistry,
        is_critical: CriticalPredicate,
        has_active_critical: ActiveCriticalProbe,
    ) -> Result<Self, AdmissionError> {
        if config.max_concurrent < 1 {
            return Err(AdmissionError::InvalidConcurrency {
                value: config.max_concurrent,
            });
        }
        Ok(Self {
            shared: Arc::new(AdmissionShared {
                config,
                timers,
                is_critical,
                has_active_critical,
                state: Mutex::new(AdmissionState {
                    in_flight: 0,
                    queue: PriorityQueue::new(),
                    pending_dequeue: None,
                    destroyed: false,
                }),
            }),
        })
    }

    /// Queue `ticket` for admission.
    ///
    /// Fails synchronously with [`AdmissionError::QueueFull`] when the queue
    /// is at capacity, or [`AdmissionError::QueueDestroyed`] after
    /// [`destroy`](Self::destroy). Otherwise returns a waiter that resolves
    /// at admission or rejection.
    pub fn enqueue(&self, ticket: QueueTicket) -> Result<AdmissionWaiter, AdmissionError> {
        let mut state = self.shared.state.lock().expect("admission state poisoned");
        if state.destroyed {
            return Err(AdmissionError::QueueDestroyed);
        }
        if let Some(max) = self.shared.config.max_queue_size
            && state.queue.len() >= max
        {
            return Err(AdmissionError::QueueFull { id: ticket.id });
        }
        let (tx, rx) = oneshot::channel();
        tracing::trace!(id = %ticket.id, priority = ?ticket.priority, "request queued");
        state.queue.push(ticket, tx);
        self.schedule_dequeue(&mut state);
        Ok(AdmissionWaiter { rx })
    }

    /// Release one admission slot and schedule the next tick.
    pub fn mark_complete(&self) {
        let mut state = self.shared.state.lock().expect("admission state poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        self.schedule_dequeue(&mut state);
    }

    /// Cancel the queued request with `id`, rejecting its waiter. Returns
    /// whether anything was removed.
    pub fn cancel_queued(&self, id: &RequestId) -> bool {
        let mut state = self.shared.state.lock().expect("admission state poisoned");
        match state.queue.remove_by_id(id) {
            Some((ticket, waiter)) => {
                let _ = waiter.send(Err(AdmissionError::Canceled { id: ticket.id }));
                true
            }
            None => false,
        }
    }

    /// Reject every queued request with [`AdmissionError::QueueCleared`].
    pub fn clear(&self) {
        let drained = {
            let mut state = self.shared.state.lock().expect("admission state poisoned");
            state.queue.clear_all()
        };
        for (_, waiter) in drained {
            let _ = waiter.send(Err(AdmissionError::QueueCleared));
        }
    }

    /// Tear the queue down: cancel the pending tick, reject every queued
    /// request with [`AdmissionError::QueueDestroyed`], zero `in_flight`,
    /// and refuse future enqueues.
    pub fn destroy(&self) {
        let drained = {
            let mut state = self.shared.state.lock().expect("admission state poisoned");
            if let Some(timer) = state.pending_dequeue.take() {
                timer.cancel();
            }
            state.destroyed = true;
            state.in_flight = 0;
            state.queue.clear_all()
        };
        for (_, waiter) in drained {
            let _ = waiter.send(Err(AdmissionError::QueueDestroyed));
        }
    }

    /// Currently admitted request count.
    pub fn in_flight(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("admission state poisoned")
            .in_flight
    }

    /// Current queue length.
    pub fn queue_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("admission state poisoned")
            .queue
            .len()
    }

    /// Queued tickets in admission order, for diagnostics.
    pub fn queue_snapshot(&self) -> Vec<QueueTicket> {
        self.shared
            .state
            .lock()
            .expect("admission state poisoned")
            .queue
            .snapshot()
    }

    /// Coalesce to a single pending dequeue tick.
    fn schedule_dequeue(&self, state: &mut AdmissionState) {
        if let Some(timer) = state.pending_dequeue.take() {
            timer.cancel();
        }
        if state.destroyed {
            return;
        }
        let sleep = self.shared.timers.sleep(self.shared.config.queue_delay);
        state.pending_dequeue = Some(sleep.handle());
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if sleep.wait().await == TimerOutcome::Fired {
                Self::drain(&shared);
            }
        });
    }

    /// Admit from the top while capacity remains, honoring critical
    /// preemption.
    fn drain(shared: &Arc<AdmissionShared>) {
        let mut admitted = Vec::new();
        {
            let mut state = shared.state.lock().expect("admission state poisoned");
            state.pending_dequeue = None;
            while state.in_flight < shared.config.max_concurrent {
                let Some(top) = state.queue.peek() else {
                    break;
                };
                if !(shared.is_critical)(top) && (shared.has_active_critical)() {
                    // Non-critical items stay queued while criticals are
                    // active.
                    break;
                }
                let (ticket, waiter) = state.queue.pop().expect("peeked item exists");
                state.in_flight += 1;
                admitted.push((ticket, waiter));
            }
        }
        for (ticket, waiter) in admitted {
            tracing::trace!(id = %ticket.id, "request admitted");
            if waiter.send(Ok(ticket)).is_err() {
                // The requester went away between admission and delivery.
                let mut state = shared.state.lock().expect("admission state poisoned");
                state.in_flight = state.in_flight.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Priority;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ticket(id: &str, priority: Priority, timestamp_ms: i64) -> QueueTicket {
        QueueTicket {
            id: RequestId::new(id),
            priority,
            timestamp_ms,
        }
    }

    fn controller(
        max_concurrent: usize,
        max_queue_size: Option<usize>,
        critical_active: Arc<AtomicBool>,
    ) -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig {
                max_concurrent,
                queue_delay: Duration::from_millis(100),
                max_queue_size,
            },
            TimerRegistry::new(),
            Arc::new(|t: &QueueTicket| t.priority >= Priority::Critical),
            Arc::new(move || critical_active.load(Ordering::SeqCst)),
        )
        .expect("valid config")
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = AdmissionController::new(
            AdmissionConfig {
                max_concurrent: 0,
                queue_delay: Duration::ZERO,
                max_queue_size: None,
            },
            TimerRegistry::new(),
            Arc::new(|_: &QueueTicket| false),
            Arc::new(|| false),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn admits_in_priority_order() {
        let ctrl = controller(1, None, Arc::new(AtomicBool::new(false)));
        let wl = ctrl.enqueue(ticket("low", Priority::Low, 0)).unwrap();
        let wh = ctrl.enqueue(ticket("high", Priority::High, 0)).unwrap();

        let high = wh.admitted().await.unwrap();
        assert_eq!(high.id, RequestId::new("high"));
        assert_eq!(ctrl.in_flight(), 1);

        ctrl.mark_complete();
        let low = wl.admitted().await.unwrap();
        assert_eq!(low.id, RequestId::new("low"));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_fails_synchronously_and_recovers() {
        let ctrl = controller(1, Some(3), Arc::new(AtomicBool::new(false)));
        let _w1 = ctrl.enqueue(ticket("a", Priority::Medium, 0)).unwrap();
        let _w2 = ctrl.enqueue(ticket("b", Priority::Medium, 1)).unwrap();
        let _w3 = ctrl.enqueue(ticket("c", Priority::Medium, 2)).unwrap();

        let rejected = ctrl.enqueue(ticket("d", Priority::Medium, 3));
        assert!(matches!(
            rejected,
            Err(AdmissionError::QueueFull { id }) if id == RequestId::new("d")
        ));

        // Let the tick admit one, freeing a queue slot.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ctrl.queue_len(), 2);
        assert!(ctrl.enqueue(ticket("e", Priority::Medium, 4)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_blocks_non_critical_admission() {
        let critical_active = Arc::new(AtomicBool::new(true));
        let ctrl = controller(2, None, Arc::clone(&critical_active));

        let medium = ctrl.enqueue(ticket("medium", Priority::Medium, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Still queued: a critical request is active elsewhere.
        assert_eq!(ctrl.queue_len(), 1);
        assert_eq!(ctrl.in_flight(), 0);

        critical_active.store(false, Ordering::SeqCst);
        ctrl.mark_complete();
        let admitted = medium.admitted().await.unwrap();
        assert_eq!(admitted.id, RequestId::new("medium"));
    }

    #[tokio::test(start_paused = true)]
    async fn critical_items_admit_despite_active_criticals() {
        let ctrl = controller(2, None, Arc::new(AtomicBool::new(true)));
        let waiter = ctrl
            .enqueue(ticket("critical", Priority::Critical, 0))
            .unwrap();
        let admitted = waiter.admitted().await.unwrap();
        assert_eq!(admitted.id, RequestId::new("critical"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_rejects_the_waiter() {
        let ctrl = controller(1, None, Arc::new(AtomicBool::new(false)));
        // Occupy the only slot so "victim" stays queued.
        let first = ctrl.enqueue(ticket("first", Priority::High, 0)).unwrap();
        first.admitted().await.unwrap();

        let victim = ctrl.enqueue(ticket("victim", Priority::Low, 1)).unwrap();
        assert!(ctrl.cancel_queued(&RequestId::new("victim")));
        assert!(!ctrl.cancel_queued(&RequestId::new("victim")));
        assert!(matches!(
            victim.admitted().await,
            Err(AdmissionError::Canceled { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_rejects_all_queued_waiters() {
        let ctrl = controller(1, None, Arc::new(AtomicBool::new(false)));
        let first = ctrl.enqueue(ticket("first", Priority::High, 0)).unwrap();
        first.admitted().await.unwrap();
        let a = ctrl.enqueue(ticket("a", Priority::Low, 1)).unwrap();
        let b = ctrl.enqueue(ticket("b", Priority::Low, 2)).unwrap();

        ctrl.clear();
        assert!(matches!(a.admitted().await, Err(AdmissionError::QueueCleared)));
        assert!(matches!(b.admitted().await, Err(AdmissionError::QueueCleared)));
        assert_eq!(ctrl.queue_len(), 0);
        // The queue still works afterwards.
        assert!(ctrl.enqueue(ticket("c", Priority::Low, 3)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_rejects_everything() {
        let ctrl = controller(1, None, Arc::new(AtomicBool::new(false)));
        let first = ctrl.enqueue(ticket("first", Priority::High, 0)).unwrap();
        first.admitted().await.unwrap();
        let queued = ctrl.enqueue(ticket("queued", Priority::Low, 1)).unwrap();

        ctrl.destroy();
        assert!(matches!(
            queued.admitted().await,
            Err(AdmissionError::QueueDestroyed)
        ));
        assert_eq!(ctrl.in_flight(), 0);
        assert_eq!(ctrl.queue_len(), 0);
        assert!(matches!(
            ctrl.enqueue(ticket("late", Priority::Low, 2)),
            Err(AdmissionError::QueueDestroyed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mark_complete_never_goes_negative() {
        let ctrl = controller(1, None, Arc::new(AtomicBool::new(false)));
        ctrl.mark_complete();
        ctrl.mark_complete();
        assert_eq!(ctrl.in_flight(), 0);
    }
}
