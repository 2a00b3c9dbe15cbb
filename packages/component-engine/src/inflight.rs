//! In-flight accounting.
//!
//! A counter of pending work with an awaitable zero, used by the mediator to
//! drain invocations on graceful stop and by outer subscriptions to wait for
//! their events before completing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Counts in-flight work items.
#[derive(Debug, Default)]
pub struct InflightCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement, notifying waiters when the count hits zero.
    pub fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inflight counter decremented below zero");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Increment now and decrement when the guard drops.
    pub fn guard(self: &Arc<Self>) -> InflightGuard {
        self.inc();
        InflightGuard {
            counter: self.clone(),
        }
    }

    /// Wait for the count to reach zero.
    ///
    /// Notify is edge-triggered, so this loops with a recheck.
    pub async fn wait_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for zero for at most `timeout`. Returns false on timeout.
    pub async fn wait_zero_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_zero()).await.is_ok()
    }
}

/// RAII guard for decrementing the in-flight count on drop.
///
/// Ensures the count is decremented even if the holder panics or is
/// cancelled, so drains never hang on lost work.
#[derive(Debug)]
pub struct InflightGuard {
    counter: Arc<InflightCounter>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.dec();
    }
}
