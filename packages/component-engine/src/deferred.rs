//! Deferred completion: hold back a callback signal until a scope closes.
//!
//! Some callers must not let a result escape while they are still inside a
//! critical section (holding a lock, or before a child context is fully
//! linked). They open a [`DeferredExecutorCallback`] around the wrapped
//! callback, hand out [`DeferredExecutorCallback::callback`], and the first
//! signal is buffered until the scope closes:
//!
//! ```ignore
//! let scope = DeferredExecutorCallback::open(callback);
//! executor.execute(ctx, scope.callback()); // may complete synchronously
//! link_child_context();
//! drop(scope); // buffered signal delivered here
//! ```
//!
//! The module current when the result was produced is captured and made
//! current again while the buffered signal is delivered, so the delegate
//! observes the producer's module rather than the closer's. Signals arriving
//! after the scope closed are delivered directly.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::exec_scope::{self, ModuleId};
use crate::executor::Callback;

struct Buffered<T> {
    outcome: Result<T, anyhow::Error>,
    module: Option<ModuleId>,
}

enum DeferredState<T> {
    Open(Option<Buffered<T>>),
    Closed,
}

/// RAII scope that buffers the first completion signal until it closes.
pub struct DeferredExecutorCallback<T: Send + 'static> {
    state: Arc<Mutex<DeferredState<T>>>,
    delegate: Callback<T>,
    callback: Callback<T>,
}

impl<T: Send + 'static> DeferredExecutorCallback<T> {
    /// Open a scope around `delegate`.
    pub fn open(delegate: Callback<T>) -> Self {
        let state = Arc::new(Mutex::new(DeferredState::Open(None)));
        let callback = {
            let state = state.clone();
            let delegate = delegate.clone();
            Callback::new(move |outcome| {
                let module = exec_scope::current_module();
                let mut guard = lock(&state);
                match &mut *guard {
                    DeferredState::Open(slot) => {
                        *slot = Some(Buffered { outcome, module });
                    }
                    DeferredState::Closed => {
                        drop(guard);
                        delegate.deliver(outcome);
                    }
                }
            })
        };
        Self {
            state,
            delegate,
            callback,
        }
    }

    /// The callback to hand to the producer. Only its first signal counts.
    pub fn callback(&self) -> Callback<T> {
        self.callback.clone()
    }

    /// True while a signal is buffered and not yet delivered.
    pub fn has_pending(&self) -> bool {
        matches!(&*lock(&self.state), DeferredState::Open(Some(_)))
    }

    /// Close the scope, delivering the buffered signal if there is one.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let buffered = {
            let mut guard = lock(&self.state);
            match std::mem::replace(&mut *guard, DeferredState::Closed) {
                DeferredState::Open(buffered) => buffered,
                DeferredState::Closed => None,
            }
        };
        if let Some(Buffered { outcome, module }) = buffered {
            exec_scope::with_module(module, || self.delegate.deliver(outcome));
        }
    }
}

impl<T: Send + 'static> Drop for DeferredExecutorCallback<T> {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
