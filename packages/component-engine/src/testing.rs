//! Testing utilities for components and processors.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature (and always in
//! this crate's own tests):
//!
//! ```toml
//! [dev-dependencies]
//! component-engine = { path = "../component-engine", features = ["testing"] }
//! ```
//!
//! ## Counting Signals with `RecordingCallback`
//!
//! ```ignore
//! let recorder = RecordingCallback::new();
//! mediator.execute(ctx, recorder.callback());
//! recorder.latch().await_zero().await;
//! assert_eq!(recorder.signals(), 1);
//! ```
//!
//! ## Draining a Processor Stream
//!
//! ```ignore
//! let outcomes = collect_outcomes(processor.apply(upstream)).await;
//! assert_eq!(outcomes.succeeded.len(), 10);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::Notify;

use crate::error::MessagingError;
use crate::event::{Event, TypedValue};
use crate::executor::{AsyncFnExecutor, Callback, ComponentExecutor, ComponentOutput, FnExecutor};

// =============================================================================
// Completion Latch
// =============================================================================

/// Waits for an exact number of completions.
///
/// Tests should wait for meaning, not time. Wrap with
/// `tokio::time::timeout` if the test might hang.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    /// A latch expecting `expected` completions.
    pub fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        })
    }

    /// Record one completion.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("CompletionLatch decremented below zero - more completions than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn await_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for zero for at most `timeout`. Returns false on timeout.
    pub async fn await_zero_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.await_zero()).await.is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

// =============================================================================
// Recording Callback
// =============================================================================

/// Records every outcome delivered to the callbacks it hands out.
///
/// Each callback it creates is single-use like any other; the recorder
/// lets a test assert how many signals actually got through.
pub struct RecordingCallback<T> {
    outcomes: Arc<Mutex<Vec<Result<T, String>>>>,
    latch: Arc<CompletionLatch>,
}

impl<T: Send + 'static> RecordingCallback<T> {
    /// A recorder expecting one signal.
    pub fn new() -> Self {
        Self::expecting(1)
    }

    /// A recorder whose latch opens after `expected` signals.
    pub fn expecting(expected: usize) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(Vec::new())),
            latch: CompletionLatch::new(expected),
        }
    }

    /// A fresh callback that records into this recorder.
    pub fn callback(&self) -> Callback<T> {
        let outcomes = self.outcomes.clone();
        let latch = self.latch.clone();
        Callback::new(move |outcome: anyhow::Result<T>| {
            let outcome = outcome.map_err(|e| format!("{e:#}"));
            outcomes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(outcome);
            latch.dec();
        })
    }

    pub fn latch(&self) -> &Arc<CompletionLatch> {
        &self.latch
    }

    /// Number of signals received so far.
    pub fn signals(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Take the recorded outcomes. Errors are rendered with their chain.
    pub fn take(&self) -> Vec<Result<T, String>> {
        std::mem::take(
            &mut *self
                .outcomes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl<T: Send + 'static> Default for RecordingCallback<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stream Helpers
// =============================================================================

/// Everything a processor stream emitted, split by outcome.
#[derive(Debug, Default)]
pub struct Outcomes {
    pub succeeded: Vec<Event>,
    pub failed: Vec<MessagingError>,
}

impl Outcomes {
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads of the successful events that are strings.
    pub fn payloads(&self) -> Vec<String> {
        self.succeeded
            .iter()
            .filter_map(|e| e.message().payload().as_str().map(str::to_string))
            .collect()
    }
}

/// Drain a stream of processing results.
pub async fn collect_outcomes<S>(stream: S) -> Outcomes
where
    S: Stream<Item = Result<Event, MessagingError>>,
{
    let mut outcomes = Outcomes::default();
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => outcomes.succeeded.push(event),
            Err(failure) => outcomes.failed.push(failure),
        }
    }
    outcomes
}

// =============================================================================
// Executors
// =============================================================================

/// Completes inline with the payload upper-cased (strings only).
pub fn uppercase_executor() -> Arc<dyn ComponentExecutor> {
    Arc::new(FnExecutor::new(|ctx| {
        let event = ctx.event();
        let payload = event.message().payload().as_str().unwrap_or_default();
        Ok(ComponentOutput::value(payload.to_uppercase()))
    }))
}

/// Always fails with `message`.
pub fn failing_executor(message: &'static str) -> Arc<dyn ComponentExecutor> {
    Arc::new(FnExecutor::new(move |_| Err(anyhow::anyhow!(message))))
}

/// Completes on a spawned task after `delay`, echoing the payload.
pub fn delayed_echo_executor(delay: Duration) -> Arc<dyn ComponentExecutor> {
    Arc::new(AsyncFnExecutor::new(move |ctx| async move {
        tokio::time::sleep(delay).await;
        let payload = ctx.event().message().payload().clone();
        Ok::<_, anyhow::Error>(ComponentOutput::Value(payload))
    }))
}

/// An event whose payload is the string `payload`.
pub fn text_event(payload: &str) -> Event {
    Event::of(TypedValue::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_opens_at_zero() {
        let latch = CompletionLatch::new(2);
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.await_zero().await })
        };
        latch.dec();
        assert!(!latch.is_complete());
        latch.dec();
        waiter.await.unwrap();
        assert!(latch.is_complete());
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_latch_underflow_panics() {
        let latch = CompletionLatch::new(0);
        latch.dec();
    }

    #[tokio::test]
    async fn test_recording_callback_counts_only_first_signal() {
        let recorder = RecordingCallback::<u32>::new();
        let callback = recorder.callback();
        callback.complete(1);
        callback.complete(2);
        callback.error(anyhow::anyhow!("late"));

        recorder.latch().await_zero().await;
        assert_eq!(recorder.signals(), 1);
        assert_eq!(recorder.take(), vec![Ok(1)]);
    }

    #[tokio::test]
    async fn test_collect_outcomes_splits_results() {
        let items = vec![
            Ok(text_event("a")),
            Err(MessagingError::new(text_event("b"), anyhow::anyhow!("boom"))),
            Ok(text_event("c")),
        ];
        let outcomes = collect_outcomes(futures::stream::iter(items)).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.payloads(), vec!["a", "c"]);
        assert_eq!(outcomes.failed.len(), 1);
    }
}
