//! The executor contract and its single-use completion callback.
//!
//! # Exactly-once callbacks
//!
//! Every invocation terminates through exactly one signal on its
//! [`Callback`]. The callback enforces this itself:
//!
//! - the first `complete`/`error` is delivered, later ones are logged and
//!   discarded
//! - a callback whose last clone is dropped unsignalled delivers
//!   [`EngineError::CallbackDropped`], so downstream never observes silence
//! - [`Callback::discard`] consumes it without delivering anything (used when
//!   a late result must be ignored)
//!
//! # Executors
//!
//! ```ignore
//! struct Echo;
//!
//! impl ComponentExecutor for Echo {
//!     fn execute(&self, ctx: Arc<ExecutionContext>, callback: ExecutorCallback) {
//!         callback.complete(ComponentOutput::value(ctx.event().message().payload().clone()));
//!     }
//! }
//! ```
//!
//! `execute` must not block. Asynchronous work is spawned and signals the
//! callback later, possibly from another thread; [`AsyncExecutor`] does this
//! for an [`AsyncOperation`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{panic_message, EngineError};
use crate::event::{Event, TypedValue};

// =============================================================================
// Callback
// =============================================================================

type Sink<T> = Box<dyn FnOnce(Result<T, anyhow::Error>) + Send>;

struct CallbackInner<T> {
    sink: Mutex<Option<Sink<T>>>,
}

impl<T> CallbackInner<T> {
    fn take(&self) -> Option<Sink<T>> {
        lock(&self.sink).take()
    }
}

impl<T> Drop for CallbackInner<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let sink = match self.sink.get_mut() {
            Ok(sink) => sink.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sink) = sink {
            warn!("callback dropped without a completion signal");
            sink(Err(EngineError::CallbackDropped.into()));
        }
    }
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A single-use success/error sink.
///
/// Clones share the same sink, so whichever clone signals first wins.
pub struct Callback<T> {
    inner: Arc<CallbackInner<T>>,
}

/// The callback an executor completes.
pub type ExecutorCallback = Callback<ComponentOutput>;

/// The callback that receives the event produced by an invocation.
pub type EventCallback = Callback<Event>;

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Callback<T> {
    pub fn new<F>(sink: F) -> Self
    where
        F: FnOnce(Result<T, anyhow::Error>) + Send + 'static,
    {
        Self {
            inner: Arc::new(CallbackInner {
                sink: Mutex::new(Some(Box::new(sink))),
            }),
        }
    }

    /// Signal success.
    pub fn complete(&self, value: T) {
        self.deliver(Ok(value));
    }

    /// Signal failure.
    pub fn error(&self, error: impl Into<anyhow::Error>) {
        self.deliver(Err(error.into()));
    }

    /// Deliver an outcome. Returns false if the callback was already
    /// signalled, in which case the outcome is discarded.
    pub fn deliver(&self, outcome: Result<T, anyhow::Error>) -> bool {
        match self.inner.take() {
            Some(sink) => {
                sink(outcome);
                true
            }
            None => {
                match &outcome {
                    Ok(_) => warn!("callback already signalled, discarding duplicate success"),
                    Err(e) => warn!(error = %e, "callback already signalled, discarding duplicate error"),
                }
                false
            }
        }
    }

    /// Consume the callback without delivering anything.
    pub fn discard(&self) -> bool {
        self.inner.take().is_some()
    }

    /// True once the callback was signalled or discarded.
    pub fn is_done(&self) -> bool {
        lock(&self.inner.sink).is_none()
    }

    /// A callback of another type whose outcome is mapped into this one.
    pub fn adapt<U, F>(self, map: F) -> Callback<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<U, anyhow::Error>) -> Result<T, anyhow::Error> + Send + 'static,
    {
        Callback::new(move |outcome| {
            self.deliver(map(outcome));
        })
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("done", &lock(&self.inner.sink).is_none())
            .finish()
    }
}

// =============================================================================
// Component Output
// =============================================================================

/// A structured result: an output value and, optionally, new attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputResult {
    pub output: TypedValue,
    pub attributes: Option<TypedValue>,
}

/// What an executor produces.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentOutput {
    /// No value; the message passes through unchanged.
    Void,
    /// A plain value that becomes the new payload.
    Value(TypedValue),
    /// A structured result.
    Result(OutputResult),
}

impl ComponentOutput {
    pub fn value(value: impl Into<TypedValue>) -> Self {
        ComponentOutput::Value(value.into())
    }

    pub fn result(output: impl Into<TypedValue>, attributes: Option<TypedValue>) -> Self {
        ComponentOutput::Result(OutputResult {
            output: output.into(),
            attributes,
        })
    }

    /// The value that would become the payload, if any.
    pub fn output(&self) -> Option<&TypedValue> {
        match self {
            ComponentOutput::Void => None,
            ComponentOutput::Value(value) => Some(value),
            ComponentOutput::Result(result) => Some(&result.output),
        }
    }
}

// =============================================================================
// Executor Trait
// =============================================================================

/// The pluggable unit of work behind a component.
///
/// Lifecycle hooks are driven by the [`ExecutionMediator`](crate::ExecutionMediator):
/// `initialise` and `start` lazily and at most once before the first
/// invocation, `stop` and `dispose` when the owning component shuts down.
pub trait ComponentExecutor: Send + Sync + 'static {
    /// Run the work for one invocation and signal `callback` exactly once.
    fn execute(&self, context: Arc<ExecutionContext>, callback: ExecutorCallback);

    fn initialise(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn dispose(&self) {}
}

/// A synchronous executor backed by a closure.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&ExecutionContext) -> anyhow::Result<ComponentOutput> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ComponentExecutor for FnExecutor<F>
where
    F: Fn(&ExecutionContext) -> anyhow::Result<ComponentOutput> + Send + Sync + 'static,
{
    fn execute(&self, context: Arc<ExecutionContext>, callback: ExecutorCallback) {
        callback.deliver((self.f)(&context));
    }
}

/// Asynchronous work run by an [`AsyncExecutor`].
#[async_trait]
pub trait AsyncOperation: Send + Sync + 'static {
    async fn run(&self, context: Arc<ExecutionContext>) -> anyhow::Result<ComponentOutput>;
}

/// Runs an [`AsyncOperation`] on a spawned task, completing on that task.
pub struct AsyncExecutor<O> {
    operation: Arc<O>,
}

impl<O: AsyncOperation> AsyncExecutor<O> {
    pub fn new(operation: O) -> Self {
        Self {
            operation: Arc::new(operation),
        }
    }
}

impl<O: AsyncOperation> ComponentExecutor for AsyncExecutor<O> {
    fn execute(&self, context: Arc<ExecutionContext>, callback: ExecutorCallback) {
        let operation = self.operation.clone();
        spawn_completion(async move { operation.run(context).await }, callback);
    }
}

/// An asynchronous executor backed by a closure returning a future.
pub struct AsyncFnExecutor<F> {
    f: F,
}

impl<F, Fut> AsyncFnExecutor<F>
where
    F: Fn(Arc<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ComponentOutput>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> ComponentExecutor for AsyncFnExecutor<F>
where
    F: Fn(Arc<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ComponentOutput>> + Send + 'static,
{
    fn execute(&self, context: Arc<ExecutionContext>, callback: ExecutorCallback) {
        spawn_completion((self.f)(context), callback);
    }
}

/// Drive `work` on the current runtime and signal `callback` with its
/// outcome. Panics inside the future become errors.
fn spawn_completion<Fut>(work: Fut, callback: ExecutorCallback)
where
    Fut: Future<Output = anyhow::Result<ComponentOutput>> + Send + 'static,
{
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(e) => {
            callback.error(EngineError::NoRuntime(e.to_string()));
            return;
        }
    };
    handle.spawn(async move {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(EngineError::ExecutorPanicked {
                message: panic_message(panic.as_ref()),
            }
            .into()),
        };
        callback.deliver(outcome);
    });
}
