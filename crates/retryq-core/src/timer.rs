//! Cancellable timer registry.
//!
//! Every delayed callback the engine schedules (retry sleeps, the admission
//! dequeue timer) is owned by one [`TimerRegistry`], so outstanding waits can
//! be counted, cancelled individually, or torn down together at shutdown.
//!
//! A scheduled sleep is a future resolving to [`TimerOutcome`]; the consumer
//! branches on fired vs. cancelled rather than catching a rejection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// How a scheduled sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The delay elapsed.
    Fired,
    /// The sleep was cancelled before the delay elapsed.
    Cancelled,
}

#[derive(Debug, Default)]
struct TimerTable {
    next_id: u64,
    active: HashMap<u64, oneshot::Sender<()>>,
    shut_down: bool,
}

/// Registry of outstanding sleeps.
///
/// Cloning is cheap; clones share one table.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    table: Arc<Mutex<TimerTable>>,
}

impl TimerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a sleep of `delay`.
    ///
    /// After [`shutdown`](Self::shutdown), the returned sleep resolves
    /// `Cancelled` immediately so no awaiter is left hanging.
    pub fn sleep(&self, delay: Duration) -> ScheduledSleep {
        let mut table = self.table.lock().expect("timer table poisoned");
        if table.shut_down {
            return ScheduledSleep {
                table: Arc::clone(&self.table),
                id: 0,
                delay,
                cancel_rx: None,
            };
        }
        let id = table.next_id;
        table.next_id += 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        table.active.insert(id, cancel_tx);
        ScheduledSleep {
            table: Arc::clone(&self.table),
            id,
            delay,
            cancel_rx: Some(cancel_rx),
        }
    }

    /// Number of sleeps that are scheduled and not yet fired or cancelled.
    pub fn active_count(&self) -> usize {
        self.table.lock().expect("timer table poisoned").active.len()
    }

    /// Cancel every outstanding sleep and reject all future `sleep` calls.
    pub fn shutdown(&self) {
        let mut table = self.table.lock().expect("timer table poisoned");
        table.shut_down = true;
        let outstanding = table.active.len();
        for (_, cancel_tx) in table.active.drain() {
            let _ = cancel_tx.send(());
        }
        tracing::debug!(outstanding, "timer registry shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.table.lock().expect("timer table poisoned").shut_down
    }
}

/// A pending sleep created by [`TimerRegistry::sleep`].
///
/// Await it with [`wait`](Self::wait); dropping it without awaiting
/// deregisters the timer.
#[derive(Debug)]
pub struct ScheduledSleep {
    table: Arc<Mutex<TimerTable>>,
    id: u64,
    delay: Duration,
    cancel_rx: Option<oneshot::Receiver<()>>,
}

impl ScheduledSleep {
    /// A handle that can cancel this sleep from elsewhere.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            table: Arc::clone(&self.table),
            id: self.id,
        }
    }

    /// The delay this sleep was scheduled with.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until the delay elapses or the sleep is cancelled.
    pub async fn wait(mut self) -> TimerOutcome {
        let Some(mut cancel_rx) = self.cancel_rx.take() else {
            // Scheduled after shutdown.
            return TimerOutcome::Cancelled;
        };
        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.delay) => TimerOutcome::Fired,
            _ = &mut cancel_rx => TimerOutcome::Cancelled,
        };
        self.deregister();
        outcome
    }

    fn deregister(&self) {
        self.table
            .lock()
            .expect("timer table poisoned")
            .active
            .remove(&self.id);
    }
}

impl Drop for ScheduledSleep {
    fn drop(&mut self) {
        if self.cancel_rx.is_some() {
            self.deregister();
        }
    }
}

/// Cancellation handle for one scheduled sleep.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    table: Arc<Mutex<TimerTable>>,
    id: u64,
}

impl TimerHandle {
    /// Cancel the sleep. Returns whether it was still pending.
    pub fn cancel(&self) -> bool {
        let cancel_tx = self
            .table
            .lock()
            .expect("timer table poisoned")
            .active
            .remove(&self.id);
        match cancel_tx {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_fires_after_delay() {
        let registry = TimerRegistry::new();
        let sleep = registry.sleep(Duration::from_millis(500));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(sleep.wait().await, TimerOutcome::Fired);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_cancelled() {
        let registry = TimerRegistry::new();
        let sleep = registry.sleep(Duration::from_secs(3600));
        let handle = sleep.handle();
        let waiter = tokio::spawn(sleep.wait());
        tokio::task::yield_now().await;
        assert!(handle.cancel());
        assert_eq!(waiter.await.unwrap(), TimerOutcome::Cancelled);
        assert_eq!(registry.active_count(), 0);
        // A second cancel is a no-op.
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let registry = TimerRegistry::new();
        let a = registry.sleep(Duration::from_secs(10));
        let b = registry.sleep(Duration::from_secs(20));
        let wa = tokio::spawn(a.wait());
        let wb = tokio::spawn(b.wait());
        tokio::task::yield_now().await;

        registry.shutdown();
        assert_eq!(wa.await.unwrap(), TimerOutcome::Cancelled);
        assert_eq!(wb.await.unwrap(), TimerOutcome::Cancelled);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn sleep_after_shutdown_is_rejected_synchronously() {
        let registry = TimerRegistry::new();
        registry.shutdown();
        let sleep = registry.sleep(Duration::from_secs(3600));
        assert_eq!(registry.active_count(), 0);
        // Resolves without advancing time.
        assert_eq!(sleep.wait().await, TimerOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_unawaited_sleep_deregisters() {
        let registry = TimerRegistry::new();
        let sleep = registry.sleep(Duration::from_secs(5));
        assert_eq!(registry.active_count(), 1);
        drop(sleep);
        assert_eq!(registry.active_count(), 0);
    }
}
