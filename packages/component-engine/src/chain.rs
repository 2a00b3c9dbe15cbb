//! Nested processor chains and their executors.
//!
//! Scope and router components receive chains as parameters
//! ([`ParameterValue::Chain`](crate::ParameterValue)) and run them through:
//!
//! - [`ProcessorChainExecutor`]: runs the chain against the current event,
//!   in the same event context
//! - [`ChildContextChainExecutor`]: runs it in a fresh *child* context,
//!   optionally with its own correlation id
//!
//! Both report through `on_success` / `on_error` callbacks. The child
//! variant guarantees:
//!
//! 1. the child context is complete before either callback fires
//! 2. the parent context is never completed as a side effect
//! 3. failures inside the chain (errors or panics) become the chain's result
//! 4. the event handed back carries the parent's context, so correlation id
//!    and root id are the caller's, not the child's

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{panic_message, EngineError, FailureKind, MessagingError};
use crate::event::{CorrelationId, Event, EventContext, TypedValue};

// =============================================================================
// Processors & Chains
// =============================================================================

/// One step of a chain.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    async fn process(&self, event: Event) -> Result<Event, MessagingError>;
}

/// A processor backed by a synchronous closure.
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(Event) -> anyhow::Result<Event> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EventProcessor for FnProcessor<F>
where
    F: Fn(Event) -> anyhow::Result<Event> + Send + Sync + 'static,
{
    async fn process(&self, event: Event) -> Result<Event, MessagingError> {
        let input = event.clone();
        (self.f)(event).map_err(|e| MessagingError::new(input, e))
    }
}

/// An ordered list of processors run one after another.
pub struct MessageProcessorChain {
    name: String,
    processors: Vec<Arc<dyn EventProcessor>>,
}

impl MessageProcessorChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processors: Vec::new(),
        }
    }

    /// Append a processor.
    pub fn then(mut self, processor: impl EventProcessor) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Append a shared processor.
    pub fn then_shared(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Append a closure step.
    pub fn then_fn<F>(self, f: F) -> Self
    where
        F: Fn(Event) -> anyhow::Result<Event> + Send + Sync + 'static,
    {
        self.then(FnProcessor::new(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run every processor in order. Stops at the first failure.
    pub async fn run(&self, event: Event) -> Result<Event, MessagingError> {
        let mut event = event;
        for processor in &self.processors {
            event = processor.process(event).await?;
        }
        Ok(event)
    }
}

#[async_trait]
impl EventProcessor for MessageProcessorChain {
    async fn process(&self, event: Event) -> Result<Event, MessagingError> {
        self.run(event).await
    }
}

impl fmt::Debug for MessageProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessorChain")
            .field("name", &self.name)
            .field("processors", &self.processors.len())
            .finish()
    }
}

// =============================================================================
// Chain Result
// =============================================================================

/// The outcome of a successful chain run.
#[derive(Debug, Clone)]
pub struct ChainResult {
    event: Event,
}

impl ChainResult {
    pub fn new(event: Event) -> Self {
        Self { event }
    }

    pub fn payload(&self) -> &TypedValue {
        self.event.message().payload()
    }

    pub fn attributes(&self) -> &TypedValue {
        self.event.message().attributes()
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

/// Run `chain` on `event`, turning a panic into a failure carrying `event`.
async fn run_guarded(chain: &MessageProcessorChain, event: Event) -> Result<Event, MessagingError> {
    let input = event.clone();
    match AssertUnwindSafe(chain.run(event)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(chain = %chain.name(), panic = %message, "chain panicked");
            Err(MessagingError::with_kind(
                input,
                FailureKind::Invocation,
                EngineError::ExecutorPanicked { message }.into(),
            ))
        }
    }
}

fn spawn_with_callbacks<Fut, S, E>(work: Fut, on_success: S, on_error: E, fallback: Event)
where
    Fut: std::future::Future<Output = Result<ChainResult, MessagingError>> + Send + 'static,
    S: FnOnce(ChainResult) + Send + 'static,
    E: FnOnce(MessagingError) + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match work.await {
                    Ok(result) => on_success(result),
                    Err(error) => on_error(error),
                }
            });
        }
        Err(e) => on_error(MessagingError::new(
            fallback,
            EngineError::NoRuntime(e.to_string()).into(),
        )),
    }
}

// =============================================================================
// Processor Chain Executor
// =============================================================================

/// Runs a chain against an event in the event's own context.
#[derive(Debug, Clone)]
pub struct ProcessorChainExecutor {
    chain: Arc<MessageProcessorChain>,
    event: Event,
}

impl ProcessorChainExecutor {
    pub fn new(chain: Arc<MessageProcessorChain>, event: Event) -> Self {
        Self { chain, event }
    }

    /// Run the chain on a spawned task and report through the callbacks.
    pub fn process<S, E>(self, on_success: S, on_error: E)
    where
        S: FnOnce(ChainResult) + Send + 'static,
        E: FnOnce(MessagingError) + Send + 'static,
    {
        let fallback = self.event.clone();
        spawn_with_callbacks(async move { self.run().await }, on_success, on_error, fallback);
    }

    pub async fn run(&self) -> Result<ChainResult, MessagingError> {
        run_guarded(&self.chain, self.event.clone())
            .await
            .map(ChainResult::new)
    }
}

// =============================================================================
// Child Context Chain Executor
// =============================================================================

/// Runs a chain in a child event context.
#[derive(Debug, Clone)]
pub struct ChildContextChainExecutor {
    chain: Arc<MessageProcessorChain>,
    event: Event,
}

impl ChildContextChainExecutor {
    pub fn new(chain: Arc<MessageProcessorChain>, event: Event) -> Self {
        Self { chain, event }
    }

    /// Run the chain on a spawned task, in a child context whose correlation
    /// id is `correlation_id` (or the parent's if `None`).
    pub fn process<S, E>(self, correlation_id: Option<CorrelationId>, on_success: S, on_error: E)
    where
        S: FnOnce(ChainResult) + Send + 'static,
        E: FnOnce(MessagingError) + Send + 'static,
    {
        let fallback = self.event.clone();
        spawn_with_callbacks(
            async move { self.run(correlation_id).await },
            on_success,
            on_error,
            fallback,
        );
    }

    pub async fn run(
        &self,
        correlation_id: Option<CorrelationId>,
    ) -> Result<ChainResult, MessagingError> {
        let parent = self.event.context().clone();
        let child = parent.child(correlation_id);
        debug!(
            chain = %self.chain.name(),
            parent = %parent.id(),
            child = %child.id(),
            correlation_id = %child.correlation_id(),
            "running chain in child context"
        );

        let outcome = run_guarded(&self.chain, self.event.clone().with_context(child.clone())).await;
        match outcome {
            Ok(event) => {
                child.success();
                Ok(ChainResult::new(event.with_context(parent)))
            }
            Err(error) => {
                child.error(error.to_string());
                Err(restore_context(error, parent))
            }
        }
    }
}

fn restore_context(error: MessagingError, parent: EventContext) -> MessagingError {
    let kind = error.kind();
    let event = error.event().clone().with_context(parent);
    MessagingError::with_kind(event, kind, error.into_cause())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn upper_chain() -> MessageProcessorChain {
        MessageProcessorChain::new("upper").then_fn(|event| {
            let upper = event
                .message()
                .payload()
                .as_str()
                .map(str::to_uppercase)
                .unwrap_or_default();
            Ok(event.with_payload(upper))
        })
    }

    #[tokio::test]
    async fn test_chain_runs_processors_in_order() {
        let chain = upper_chain().then_fn(|event| Ok(event.with_variable("seen", "yes")));
        let result = chain.run(Event::of("abc")).await.unwrap();
        assert_eq!(result.message().payload().as_str(), Some("ABC"));
        assert_eq!(result.variable("seen").and_then(TypedValue::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let after = Arc::new(AtomicUsize::new(0));
        let counter = after.clone();
        let chain = MessageProcessorChain::new("failing")
            .then_fn(|event| Ok(event.with_payload("step-1")))
            .then_fn(|_| anyhow::bail!("step 2 failed"))
            .then_fn(move |event| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(event)
            });

        let err = chain.run(Event::of("x")).await.unwrap_err();
        assert!(err.to_string().contains("step 2 failed"));
        assert_eq!(err.event().message().payload().as_str(), Some("step-1"));
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_processor_chain_executor_keeps_context() {
        let event = Event::of("abc");
        let context = event.context().clone();
        let executor = ProcessorChainExecutor::new(Arc::new(upper_chain()), event);

        let (tx, rx) = oneshot::channel();
        executor.process(
            move |result| {
                let _ = tx.send(Ok(result));
            },
            |_| panic!("unexpected error"),
        );

        let result: Result<ChainResult, ()> = rx.await.unwrap();
        let result = result.unwrap();
        assert_eq!(result.payload().as_str(), Some("ABC"));
        assert_eq!(result.event().context(), &context);
        assert!(!context.is_complete());
    }

    #[tokio::test]
    async fn test_child_context_complete_before_on_success() {
        let observed: Arc<Mutex<Option<EventContext>>> = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        let chain = MessageProcessorChain::new("capture").then_fn(move |event| {
            *slot.lock().unwrap() = Some(event.context().clone());
            Ok(event)
        });

        let parent_event = Event::new(EventContext::with_correlation("parent"), Default::default());
        let parent_fired = Arc::new(AtomicUsize::new(0));
        let counter = parent_fired.clone();
        parent_event.context().on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let executor = ChildContextChainExecutor::new(Arc::new(chain), parent_event.clone());
        let (tx, rx) = oneshot::channel();
        let captured = observed.clone();
        executor.process(
            None,
            move |result| {
                let child = captured.lock().unwrap().clone().unwrap();
                let _ = tx.send((child.is_complete(), result));
            },
            |_| panic!("unexpected error"),
        );

        let (child_complete, result) = rx.await.unwrap();
        assert!(child_complete);
        assert_eq!(result.event().context(), parent_event.context());
        assert!(!parent_event.context().is_complete());
        assert_eq!(parent_fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_child_context_correlation_override() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let chain = MessageProcessorChain::new("correlation").then_fn(move |event| {
            sink.lock().unwrap().push(event.correlation_id().to_string());
            Ok(event)
        });

        let parent = Event::new(EventContext::with_correlation("original"), Default::default());
        let executor = ChildContextChainExecutor::new(Arc::new(chain), parent.clone());
        let result = executor.run(Some("X".into())).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["X".to_string()]);
        assert_eq!(result.event().correlation_id().as_str(), "original");
        assert_eq!(result.event().context().root_id(), parent.context().root_id());
    }

    #[tokio::test]
    async fn test_child_context_captures_errors_and_panics() {
        let failing = MessageProcessorChain::new("failing").then_fn(|_| anyhow::bail!("inner failure"));
        let panicking = MessageProcessorChain::new("panicking").then_fn(|_| panic!("inner panic"));

        for (chain, expected) in [(failing, "inner failure"), (panicking, "inner panic")] {
            let parent = Event::new(EventContext::with_correlation("p"), Default::default());
            let executor = ChildContextChainExecutor::new(Arc::new(chain), parent.clone());

            let (tx, rx) = oneshot::channel();
            executor.process(
                Some("child-cid".into()),
                |_| panic!("unexpected success"),
                move |error| {
                    let _ = tx.send(error);
                },
            );

            let error = rx.await.unwrap();
            assert!(error.to_string().contains(expected), "got: {error}");
            assert_eq!(error.event().correlation_id().as_str(), "p");
            assert_eq!(error.event().context(), parent.context());
            assert!(!parent.context().is_complete());
            assert_eq!(parent.context().open_children(), 0);
        }
    }
}
