//! The component message processor: the reactive stage around one
//! component.
//!
//! # Topology
//!
//! Every [`apply`](ComponentMessageProcessor::apply) call is an *outer*
//! subscription with its own driver task and output channel, so any number
//! of upstream producers can share one processor without cross-talk.
//!
//! ```text
//!  upstream A ──► outer A ─┐                     ┌─► output A
//!                          ├─► inner 0..n ──► …  ┤
//!  upstream B ──► outer B ─┘   (round-robin)     └─► output B
//! ```
//!
//! When the component may complete on a different thread than the one that
//! submitted the event, events are handed round-robin to *inner* pipelines
//! (tokio tasks sized to the concurrency factor) and results come back in
//! completion order. Otherwise the outer driver processes one event at a
//! time, waiting for each outcome even when the component runs on a
//! blocking pool, and order is preserved.
//!
//! Inner pipelines are shared by the active outer subscriptions and torn
//! down when the last one terminates; the next subscription starts a fresh
//! generation.
//!
//! # Per event
//!
//! ```text
//! resolve parameters ──err──► MessagingError (resolution)
//!   │
//!   ▼
//! location? ──no──► execute                    (no policy lookup at all)
//!   │ yes
//!   ▼
//! policy manager ──NoPolicy──► execute
//!   │ Policy
//!   ▼
//! policy.process(event, execute, …) ──► target applied to original event
//!
//! execute = MDC + span on the executing thread ─► mediator ─► return delegate
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, debug_span, trace, warn};

use crate::chain::EventProcessor;
use crate::component::{ComponentLocation, ComponentModel};
use crate::config::EngineConfig;
use crate::configuration::ConfigurationProvider;
use crate::context::ExecutionContext;
use crate::error::{EngineError, MessagingError};
use crate::event::Event;
use crate::executor::{Callback, ComponentExecutor, ComponentOutput, EventCallback, ExecutorCallback};
use crate::inflight::{InflightCounter, InflightGuard};
use crate::interceptor::{ConnectionInterceptor, Interceptor, InterceptorChain};
use crate::mdc;
use crate::mediator::ExecutionMediator;
use crate::policy::{
    NoPolicyManager, OperationExecutionFunction, ParametersProcessor, PolicyManager, ResolvedPolicy,
};
use crate::resolver::{ParameterResolver, ResolverSet};
use crate::return_delegate::{
    ReturnDelegate, TargetReturnDelegate, ValueReturnDelegate, VoidReturnDelegate, MESSAGE_EXPRESSION,
};
use crate::scheduler::{ProcessingType, Schedulers};
use crate::streaming::StreamingManager;

type StreamItem = Result<Event, MessagingError>;

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Inner pipelines
// =============================================================================

struct InnerJob {
    event: Event,
    callback: EventCallback,
}

struct InnerPipeline {
    sender: mpsc::UnboundedSender<InnerJob>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct InnerTopology {
    generation: u64,
    pipelines: Vec<InnerPipeline>,
    next: usize,
}

impl InnerTopology {
    /// Abort every pipeline. Returns how many were running.
    fn teardown(&mut self) -> usize {
        let count = self.pipelines.len();
        for pipeline in self.pipelines.drain(..) {
            pipeline.task.abort();
        }
        self.next = 0;
        count
    }
}

async fn run_inner_pipeline(
    processor: Weak<ProcessorInner>,
    mut jobs: mpsc::UnboundedReceiver<InnerJob>,
    generation: u64,
    index: usize,
) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = processor.upgrade() else {
            job.callback.error(EngineError::Abandoned {
                reason: "processor dropped",
            });
            break;
        };
        ComponentMessageProcessor { inner }
            .on_event(job.event, job.callback)
            .await;
    }
    trace!(generation, index, "inner pipeline finished");
}

// =============================================================================
// Outer subscriptions
// =============================================================================

/// Output side of one outer subscription. Closing it drops late results.
#[derive(Clone)]
struct OutputSink {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<StreamItem>>>>,
}

impl OutputSink {
    fn new() -> (Self, mpsc::UnboundedReceiver<StreamItem>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (sink, receiver)
    }

    fn send(&self, item: StreamItem) -> bool {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        lock(&self.sender).take();
    }
}

/// Counts an outer subscription as active; the last one to go stops the
/// inner pipelines.
struct SubscriptionGuard {
    processor: ComponentMessageProcessor,
}

impl SubscriptionGuard {
    fn new(processor: ComponentMessageProcessor) -> Self {
        processor.inner.active_outer.fetch_add(1, Ordering::AcqRel);
        Self { processor }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.processor.inner.active_outer.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.processor.stop_inner_pipelines(true);
        }
    }
}

/// The output of one outer subscription.
///
/// Yields exactly one item per upstream event (unless the subscription is
/// cancelled or its stragglers are abandoned). Dropping the stream cancels
/// the subscription.
pub struct ProcessedStream {
    items: UnboundedReceiverStream<StreamItem>,
    driver: JoinHandle<()>,
}

impl Stream for ProcessedStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.items).poll_next(cx)
    }
}

impl Drop for ProcessedStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl fmt::Debug for ProcessedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedStream")
            .field("finished", &self.driver.is_finished())
            .finish()
    }
}

// =============================================================================
// Processor
// =============================================================================

struct ProcessorInner {
    component: ComponentModel,
    location: Option<ComponentLocation>,
    mediator: ExecutionMediator,
    resolver: ParameterResolver,
    policy_manager: Arc<dyn PolicyManager>,
    value_delegate: Arc<dyn ReturnDelegate>,
    target: Option<TargetReturnDelegate>,
    schedulers: Schedulers,
    may_complete_in_different_thread: bool,
    config: EngineConfig,
    topology: Mutex<InnerTopology>,
    active_outer: AtomicUsize,
}

impl Drop for ProcessorInner {
    fn drop(&mut self) {
        lock(&self.topology).teardown();
    }
}

/// Drives events through one component.
///
/// Cheap to clone; clones share the executor, the inner pipelines and the
/// lifecycle state.
#[derive(Clone)]
pub struct ComponentMessageProcessor {
    inner: Arc<ProcessorInner>,
}

impl ComponentMessageProcessor {
    pub fn builder(
        component: ComponentModel,
        executor: Arc<dyn ComponentExecutor>,
    ) -> ComponentMessageProcessorBuilder {
        ComponentMessageProcessorBuilder::new(component, executor)
    }

    pub fn component(&self) -> &ComponentModel {
        &self.inner.component
    }

    pub fn location(&self) -> Option<&ComponentLocation> {
        self.inner.location.as_ref()
    }

    pub fn mediator(&self) -> &ExecutionMediator {
        &self.inner.mediator
    }

    /// What the surrounding pipeline sees. Always `CpuLite`: thread
    /// switching for the declared type happens inside the processor.
    pub fn processing_type(&self) -> ProcessingType {
        ProcessingType::CpuLite
    }

    /// The scheduling hint used internally for the declared type.
    pub fn inner_processing_type(&self) -> ProcessingType {
        self.inner.component.processing_type().scheduling_hint()
    }

    pub fn may_complete_in_different_thread(&self) -> bool {
        self.inner.may_complete_in_different_thread
    }

    /// Parameter resolutions performed (precalculated reuse not counted).
    pub fn resolution_count(&self) -> u64 {
        self.inner.resolver.resolution_count()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.active_outer.load(Ordering::Acquire)
    }

    pub fn inner_pipeline_count(&self) -> usize {
        lock(&self.inner.topology).pipelines.len()
    }

    /// Incremented every time a fresh set of inner pipelines starts.
    pub fn inner_generation(&self) -> u64 {
        lock(&self.inner.topology).generation
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn initialise(&self) -> Result<(), EngineError> {
        self.inner.mediator.initialise()
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.inner.mediator.start()
    }

    /// Stop the executor using the configured shutdown mode, then stop the
    /// inner pipelines.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.inner
            .mediator
            .stop(self.inner.config.shutdown_mode)
            .await?;
        self.stop_inner_pipelines(false);
        Ok(())
    }

    pub fn dispose(&self) -> Result<(), EngineError> {
        self.inner.mediator.dispose()
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Subscribe `upstream` through this component.
    ///
    /// Each call is independent: results for its events only ever appear on
    /// the returned stream.
    pub fn apply<S>(&self, upstream: S) -> ProcessedStream
    where
        S: Stream<Item = Event> + Send + 'static,
    {
        let (sink, receiver) = OutputSink::new();
        let subscription = SubscriptionGuard::new(self.clone());
        let driver = self.inner.schedulers.spawn(
            ProcessingType::CpuLite,
            self.clone().drive(upstream, sink, subscription),
        );
        ProcessedStream {
            items: UnboundedReceiverStream::new(receiver),
            driver,
        }
    }

    /// Run a single event through the component.
    ///
    /// Uses neither the inner pipelines nor the outer termination timeout.
    pub async fn process(&self, event: Event) -> Result<Event, MessagingError> {
        let input = event.clone();
        let (tx, rx) = oneshot::channel();
        let callback = Callback::new(move |outcome: anyhow::Result<Event>| {
            let _ = tx.send(outcome);
        });
        self.on_event(event, callback).await;
        match rx.await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(error)) => Err(MessagingError::new(input, error)),
            Err(_) => Err(MessagingError::new(input, EngineError::CallbackDropped.into())),
        }
    }

    /// Resolve parameters now and attach the resulting context to the event
    /// so the next invocation of this component reuses it.
    pub async fn resolve_for_interception(&self, event: Event) -> Result<Event, MessagingError> {
        self.inner
            .resolver
            .resolve_for_interception(event.clone())
            .await
            .map_err(|error| MessagingError::new(event, error.into()))
    }

    async fn drive<S>(self, upstream: S, sink: OutputSink, subscription: SubscriptionGuard)
    where
        S: Stream<Item = Event> + Send + 'static,
    {
        let mut upstream = Box::pin(upstream);
        let permits = Arc::new(Semaphore::new(self.inner.config.max_inflight.max(1)));
        let inflight = Arc::new(InflightCounter::new());
        let mut submitted: u64 = 0;

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let Some(event) = upstream.next().await else {
                break;
            };
            submitted += 1;
            if self.inner.may_complete_in_different_thread {
                let callback =
                    self.outer_callback(event.clone(), sink.clone(), permit, inflight.guard(), None);
                self.submit_inner(event, callback);
            } else {
                // Blocking and cpu-intensive components hop to another pool
                // and return at once; waiting for the outcome keeps order.
                let (done, completed) = oneshot::channel();
                let callback = self.outer_callback(
                    event.clone(),
                    sink.clone(),
                    permit,
                    inflight.guard(),
                    Some(done),
                );
                self.on_event(event, callback).await;
                let _ = completed.await;
            }
        }

        let drained = match self.inner.config.outer_termination_timeout {
            Some(timeout) => inflight.wait_zero_timeout(timeout).await,
            None => {
                inflight.wait_zero().await;
                true
            }
        };
        if !drained {
            warn!(
                component = %self.inner.component.name(),
                abandoned = inflight.count(),
                "outer termination timeout elapsed, abandoning in-flight events"
            );
        }
        debug!(
            component = %self.inner.component.name(),
            submitted,
            "outer subscription completed"
        );
        // Close before releasing the subscription: pipelines torn down by
        // the release must not emit into this stream.
        sink.close();
        drop(subscription);
    }

    fn outer_callback(
        &self,
        input: Event,
        sink: OutputSink,
        permit: OwnedSemaphorePermit,
        inflight: InflightGuard,
        done: Option<oneshot::Sender<()>>,
    ) -> EventCallback {
        Callback::new(move |outcome: anyhow::Result<Event>| {
            let item = outcome.map_err(|error| MessagingError::new(input, error));
            if let Err(failure) = &item {
                debug!(kind = %failure.kind(), error = %failure, "event failed");
            }
            if !sink.send(item) {
                trace!("dropping result for a closed subscription");
            }
            drop(permit);
            drop(inflight);
            if let Some(done) = done {
                let _ = done.send(());
            }
        })
    }

    fn submit_inner(&self, event: Event, callback: EventCallback) {
        let sender = {
            let mut topology = lock(&self.inner.topology);
            if topology.pipelines.is_empty() {
                self.start_inner_pipelines(&mut topology);
            }
            let index = topology.next % topology.pipelines.len();
            topology.next = topology.next.wrapping_add(1);
            topology.pipelines[index].sender.clone()
        };
        if let Err(mpsc::error::SendError(job)) = sender.send(InnerJob { event, callback }) {
            job.callback.error(EngineError::Abandoned {
                reason: "inner pipeline terminated",
            });
        }
    }

    fn start_inner_pipelines(&self, topology: &mut InnerTopology) {
        topology.generation += 1;
        let generation = topology.generation;
        let count = self.inner.config.concurrency.max(1);
        for index in 0..count {
            let (sender, receiver) = mpsc::unbounded_channel();
            let task = self.inner.schedulers.spawn(
                self.inner_processing_type(),
                run_inner_pipeline(Arc::downgrade(&self.inner), receiver, generation, index),
            );
            topology.pipelines.push(InnerPipeline { sender, task });
        }
        debug!(
            component = %self.inner.component.name(),
            generation,
            pipelines = count,
            "started inner pipelines"
        );
    }

    fn stop_inner_pipelines(&self, only_if_idle: bool) {
        let mut topology = lock(&self.inner.topology);
        if only_if_idle && self.inner.active_outer.load(Ordering::Acquire) > 0 {
            return;
        }
        let stopped = topology.teardown();
        if stopped > 0 {
            debug!(
                component = %self.inner.component.name(),
                generation = topology.generation,
                pipelines = stopped,
                "stopped inner pipelines"
            );
        }
    }

    async fn on_event(&self, event: Event, callback: EventCallback) {
        let context = match self.inner.resolver.resolve(&event).await {
            Ok(resolved) => resolved.context,
            Err(error) => {
                debug!(
                    component = %self.inner.component.name(),
                    correlation_id = %event.correlation_id(),
                    error = %error,
                    "parameter resolution failed"
                );
                callback.error(error);
                return;
            }
        };
        let event = event.without_interception();

        let Some(location) = self.inner.location.clone() else {
            self.execute_operation(context, event, self.return_delegate(), callback);
            return;
        };

        let parameters: ParametersProcessor = {
            let context = context.clone();
            Arc::new(move || context.parameters().clone())
        };
        let policy = self.inner.policy_manager.create_operation_policy(
            &self.inner.component,
            &location,
            &event,
            &parameters,
        );
        match policy {
            ResolvedPolicy::NoPolicy => {
                self.execute_operation(context, event, self.return_delegate(), callback)
            }
            policy => self.execute_with_policy(policy, context, event, location, parameters, callback),
        }
    }

    fn return_delegate(&self) -> Arc<dyn ReturnDelegate> {
        match &self.inner.target {
            Some(target) => Arc::new(target.clone()),
            None => self.inner.value_delegate.clone(),
        }
    }

    /// Inside a policy the operation result replaces the payload, so the
    /// policy sees it; a target is applied to the original event once the
    /// policy is done.
    fn execute_with_policy(
        &self,
        policy: ResolvedPolicy,
        context: Arc<ExecutionContext>,
        event: Event,
        location: ComponentLocation,
        parameters: ParametersProcessor,
        callback: EventCallback,
    ) {
        let execution: OperationExecutionFunction = {
            let processor = self.clone();
            let delegate = self.inner.value_delegate.clone();
            Arc::new(move |event: Event, callback: EventCallback| {
                let event = event.without_interception();
                context.change_event(event.clone());
                processor.execute_operation(context.clone(), event, delegate.clone(), callback);
            })
        };
        let callback = match &self.inner.target {
            Some(target) => {
                let target = target.clone();
                let original = event.clone();
                callback.adapt(move |outcome: anyhow::Result<Event>| {
                    outcome.map(|result| target.store(result.message().clone(), &original))
                })
            }
            None => callback,
        };
        policy.process(event, execution, parameters, &location, callback);
    }

    /// Invoke the mediator on the pool for the declared processing type,
    /// with the diagnostic context attached to the executing thread.
    fn execute_operation(
        &self,
        context: Arc<ExecutionContext>,
        event: Event,
        delegate: Arc<dyn ReturnDelegate>,
        callback: EventCallback,
    ) {
        let correlation_id = event.correlation_id().to_string();
        let executor_callback: ExecutorCallback = callback.adapt(
            move |outcome: anyhow::Result<ComponentOutput>| {
                outcome.and_then(|output| delegate.to_event(output, &event))
            },
        );
        let mediator = self.inner.mediator.clone();
        let processor_path = self.inner.location.as_ref().map(ComponentLocation::location);

        let job = move || {
            let _correlation = mdc::put(mdc::CORRELATION_ID_KEY, correlation_id.clone());
            let _path = processor_path
                .as_ref()
                .and_then(|path| mdc::put_if_absent(mdc::PROCESSOR_PATH_KEY, path.clone()));
            let span = debug_span!(
                "component_execution",
                component = %mediator.component().name(),
                correlation_id = %correlation_id,
                processor_path = processor_path.as_deref().unwrap_or(""),
            );
            let _entered = span.enter();
            mediator.execute(context, executor_callback);
        };

        match self.inner_processing_type() {
            ProcessingType::CpuLite | ProcessingType::CpuLiteAsync => job(),
            other => {
                self.inner.schedulers.dispatch(other, job);
            }
        }
    }
}

#[async_trait]
impl EventProcessor for ComponentMessageProcessor {
    async fn process(&self, event: Event) -> Result<Event, MessagingError> {
        ComponentMessageProcessor::process(self, event).await
    }
}

impl fmt::Debug for ComponentMessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentMessageProcessor")
            .field("component", &self.inner.component.name())
            .field("location", &self.inner.location)
            .field("target", &self.inner.target)
            .field(
                "may_complete_in_different_thread",
                &self.inner.may_complete_in_different_thread,
            )
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ComponentMessageProcessor`].
///
/// Misconfiguration (an invalid target, a missing configuration) is
/// reported by [`build`](Self::build), before any event is processed.
pub struct ComponentMessageProcessorBuilder {
    component: ComponentModel,
    executor: Arc<dyn ComponentExecutor>,
    location: Option<ComponentLocation>,
    resolvers: ResolverSet,
    configuration: Option<Arc<dyn ConfigurationProvider>>,
    policy_manager: Arc<dyn PolicyManager>,
    streaming: StreamingManager,
    interceptors: Vec<Arc<dyn Interceptor>>,
    target: Option<(String, String)>,
    void_output: bool,
    completes_asynchronously: bool,
    schedulers: Option<Schedulers>,
    config: EngineConfig,
}

impl ComponentMessageProcessorBuilder {
    fn new(component: ComponentModel, executor: Arc<dyn ComponentExecutor>) -> Self {
        Self {
            component,
            executor,
            location: None,
            resolvers: ResolverSet::new(),
            configuration: None,
            policy_manager: Arc::new(NoPolicyManager),
            streaming: StreamingManager::new(),
            interceptors: Vec::new(),
            target: None,
            void_output: false,
            completes_asynchronously: false,
            schedulers: None,
            config: EngineConfig::default(),
        }
    }

    /// Attach the component to a routable pipeline. Without a location no
    /// policy applies.
    pub fn with_location(mut self, location: ComponentLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_resolvers(mut self, resolvers: ResolverSet) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_configuration_provider(mut self, provider: Arc<dyn ConfigurationProvider>) -> Self {
        self.configuration = Some(provider);
        self
    }

    pub fn with_policy_manager(mut self, policy_manager: Arc<dyn PolicyManager>) -> Self {
        self.policy_manager = policy_manager;
        self
    }

    pub fn with_streaming_manager(mut self, streaming: StreamingManager) -> Self {
        self.streaming = streaming;
        self
    }

    /// Add an interceptor after the built-in connection interceptor.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Store the result in `target` (the whole message) instead of replacing
    /// the message.
    pub fn with_target(self, target: impl Into<String>) -> Self {
        self.with_target_value(target, MESSAGE_EXPRESSION)
    }

    /// Store `target_value` (`#[message]`, `#[payload]` or `#[attributes]`)
    /// of the result in `target`.
    pub fn with_target_value(
        mut self,
        target: impl Into<String>,
        target_value: impl Into<String>,
    ) -> Self {
        self.target = Some((target.into(), target_value.into()));
        self
    }

    /// The component returns nothing; events pass through unchanged.
    pub fn with_void_output(mut self) -> Self {
        self.void_output = true;
        self
    }

    /// Declare that the executor completes on other tasks (for example, an
    /// [`AsyncFnExecutor`](crate::AsyncFnExecutor)).
    pub fn completes_asynchronously(mut self, value: bool) -> Self {
        self.completes_asynchronously = value;
        self
    }

    pub fn with_schedulers(mut self, schedulers: Schedulers) -> Self {
        self.schedulers = Some(schedulers);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ComponentMessageProcessor, EngineError> {
        let name = self.component.name().to_string();
        if self.component.requires_config() && self.configuration.is_none() {
            return Err(EngineError::Validation {
                component: name,
                message: "component requires a configuration but none was provided".to_string(),
            });
        }

        let target = match &self.target {
            Some((target, value)) => Some(TargetReturnDelegate::new(
                &name,
                target,
                value,
                self.streaming.clone(),
            )?),
            None => None,
        };
        let value_delegate: Arc<dyn ReturnDelegate> = if self.void_output {
            Arc::new(VoidReturnDelegate)
        } else {
            Arc::new(ValueReturnDelegate::new(self.streaming.clone()))
        };

        let schedulers = match self.schedulers {
            Some(schedulers) => schedulers,
            None => Schedulers::try_current()?,
        };

        let may_complete_in_different_thread = self.completes_asynchronously
            || may_complete_in_different_thread(&self.component, self.configuration.as_deref());

        let interceptors = self
            .interceptors
            .into_iter()
            .fold(InterceptorChain::new().with(ConnectionInterceptor), |chain, interceptor| {
                chain.with_shared(interceptor)
            });
        let mediator = ExecutionMediator::builder(self.component.clone(), self.executor)
            .with_interceptors(interceptors)
            .with_termination_timeout(self.config.termination_timeout)
            .build();
        let resolver = ParameterResolver::new(
            self.component.clone(),
            self.location.clone(),
            self.resolvers,
            self.configuration,
        );

        debug!(
            component = %name,
            location = ?self.location,
            target = ?target.as_ref().map(TargetReturnDelegate::target),
            may_complete_in_different_thread,
            "built component processor"
        );

        Ok(ComponentMessageProcessor {
            inner: Arc::new(ProcessorInner {
                component: self.component,
                location: self.location,
                mediator,
                resolver,
                policy_manager: self.policy_manager,
                value_delegate,
                target,
                schedulers,
                may_complete_in_different_thread,
                config: self.config,
                topology: Mutex::new(InnerTopology::default()),
                active_outer: AtomicUsize::new(0),
            }),
        })
    }
}

/// Whether completion may happen on another thread than submission.
///
/// Without a configuration the executor completes inline. A dynamic
/// configuration may build instances (and connect) per event; a static one
/// only defers completion when it retries.
fn may_complete_in_different_thread(
    component: &ComponentModel,
    configuration: Option<&dyn ConfigurationProvider>,
) -> bool {
    if !component.requires_config() {
        return false;
    }
    match configuration {
        None => false,
        Some(provider) if provider.is_dynamic() => true,
        // A provider that is neither dynamic nor static is treated as dynamic.
        Some(provider) => provider
            .static_instance()
            .map(|instance| instance.retry_policy().is_enabled())
            .unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{
        ConfigurationInstance, DynamicConfigurationProvider, RetryPolicy, StaticConfigurationProvider,
    };
    use crate::error::FailureKind;
    use crate::event::{EventContext, Message, TypedValue};
    use crate::executor::{AsyncFnExecutor, FnExecutor};
    use crate::policy::{DefaultPolicyManager, ShortCircuitPolicy};
    use crate::resolver::{FnResolver, PayloadResolver, VariableResolver};
    use crate::return_delegate::PAYLOAD_EXPRESSION;
    use crate::testing::collect_outcomes;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn model() -> ComponentModel {
        ComponentModel::new("test:upper", "test-module")
    }

    fn location() -> ComponentLocation {
        ComponentLocation::new("flow", "processors/0")
    }

    fn upper() -> Arc<dyn ComponentExecutor> {
        Arc::new(FnExecutor::new(|ctx| {
            let payload = ctx.event().message().payload().as_str().unwrap_or("").to_string();
            if payload == "bad" {
                anyhow::bail!("cannot process '{payload}'");
            }
            Ok(ComponentOutput::value(payload.to_uppercase()))
        }))
    }

    fn async_upper() -> Arc<dyn ComponentExecutor> {
        Arc::new(AsyncFnExecutor::new(|ctx: Arc<ExecutionContext>| async move {
            tokio::task::yield_now().await;
            let payload = ctx.event().message().payload().as_str().unwrap_or("").to_string();
            Ok::<_, anyhow::Error>(ComponentOutput::value(payload.to_uppercase()))
        }))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_value_replaces_payload() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .build()
            .unwrap();
        let out = processor.process(Event::of("hello")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("HELLO"));
    }

    #[tokio::test]
    async fn test_target_preserves_message_and_stores_result() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .with_target("var")
            .build()
            .unwrap();
        let input = Event::new(EventContext::new(), Message::new("hello", json!({"h": 1})));
        let out = processor.process(input.clone()).await.unwrap();

        assert_eq!(out.message(), input.message());
        let stored = out.variable("var").and_then(TypedValue::as_message).unwrap();
        assert_eq!(stored.payload().as_str(), Some("HELLO"));
    }

    #[tokio::test]
    async fn test_void_output_passes_event_through() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .with_void_output()
            .build()
            .unwrap();
        let out = processor.process(Event::of("hello")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("hello"));
    }

    #[tokio::test]
    async fn test_no_policy_runs_on_calling_thread() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let executor = Arc::new(FnExecutor::new(move |_| {
            *recorder.lock().unwrap() = Some(std::thread::current().id());
            Ok(ComponentOutput::value("done"))
        }));
        let processor = ComponentMessageProcessor::builder(model(), executor)
            .with_location(location())
            .with_policy_manager(Arc::new(DefaultPolicyManager::new()))
            .build()
            .unwrap();

        let out = processor.process(Event::of("x")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("done"));
        assert_eq!(*seen.lock().unwrap(), Some(std::thread::current().id()));
    }

    #[tokio::test]
    async fn test_policy_lookup_skipped_without_location() {
        let manager = Arc::new(DefaultPolicyManager::new());
        manager.register(
            "cache",
            |_, _| true,
            Arc::new(ShortCircuitPolicy::new(|_| None)),
        );

        let detached = ComponentMessageProcessor::builder(model(), upper())
            .with_policy_manager(manager.clone())
            .build()
            .unwrap();
        detached.process(Event::of("a")).await.unwrap();
        assert_eq!(manager.lookup_count(), 0);

        let attached = ComponentMessageProcessor::builder(model(), upper())
            .with_location(location())
            .with_policy_manager(manager.clone())
            .build()
            .unwrap();
        let out = attached.process(Event::of("a")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("A"));
        assert_eq!(manager.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_target_applied_after_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = Arc::new(FnExecutor::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ComponentOutput::value("fresh"))
        }));
        let manager = Arc::new(DefaultPolicyManager::new());
        manager.register(
            "cache",
            |_, _| true,
            Arc::new(ShortCircuitPolicy::new(|event: &Event| {
                (event.message().payload().as_str() == Some("cached"))
                    .then(|| Ok(event.clone().with_payload("from-cache")))
            })),
        );
        let processor = ComponentMessageProcessor::builder(model(), executor)
            .with_location(location())
            .with_policy_manager(manager)
            .with_target_value("var", PAYLOAD_EXPRESSION)
            .build()
            .unwrap();

        let out = processor.process(Event::of("cached")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("cached"));
        assert_eq!(out.variable("var").and_then(TypedValue::as_str), Some("from-cache"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = processor.process(Event::of("other")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("other"));
        assert_eq!(out.variable("var").and_then(TypedValue::as_str), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_error_skips_executor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = Arc::new(FnExecutor::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ComponentOutput::Void)
        }));
        let processor = ComponentMessageProcessor::builder(model(), executor)
            .with_resolvers(ResolverSet::new().add("id", VariableResolver::required("id")))
            .build()
            .unwrap();

        let err = processor.process(Event::of("payload")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resolution);
        assert_eq!(err.event().message().payload().as_str(), Some("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invocation_error_carries_event() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .build()
            .unwrap();
        let err = processor.process(Event::of("bad")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Invocation);
        assert_eq!(err.event().message().payload().as_str(), Some("bad"));
        assert!(err.to_string().contains("cannot process"));
    }

    #[tokio::test]
    async fn test_precalculated_context_is_reused() {
        let resolutions = Arc::new(AtomicU64::new(0));
        let counter = resolutions.clone();
        let executor = Arc::new(FnExecutor::new(|ctx| {
            Ok(ComponentOutput::value(ctx.value("greeting").cloned().unwrap_or_default()))
        }));
        let processor = ComponentMessageProcessor::builder(model(), executor)
            .with_location(location())
            .with_resolvers(ResolverSet::new().add(
                "greeting",
                FnResolver::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(TypedValue::from("hi"))
                }),
            ))
            .build()
            .unwrap();

        let intercepted = processor
            .resolve_for_interception(Event::of("x"))
            .await
            .unwrap();
        let out = processor.process(intercepted).await.unwrap();

        assert_eq!(out.message().payload().as_str(), Some("hi"));
        assert!(out.interception().is_none());
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(processor.resolution_count(), 1);
    }

    #[tokio::test]
    async fn test_build_validation() {
        let err = ComponentMessageProcessor::builder(model(), upper())
            .with_target("#[vars.out]")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let err = ComponentMessageProcessor::builder(model().with_requires_config(true), upper())
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_may_complete_in_different_thread_rule() {
        let build = |component: ComponentModel, provider: Option<Arc<dyn ConfigurationProvider>>| {
            let mut builder = ComponentMessageProcessor::builder(component, upper());
            if let Some(provider) = provider {
                builder = builder.with_configuration_provider(provider);
            }
            builder.build().unwrap().may_complete_in_different_thread()
        };
        let configured = model().with_requires_config(true);

        assert!(!build(model(), None));
        assert!(!build(
            configured.clone(),
            Some(Arc::new(StaticConfigurationProvider::new(ConfigurationInstance::new(
                "plain",
                json!({})
            ))))
        ));
        assert!(build(
            configured.clone(),
            Some(Arc::new(StaticConfigurationProvider::new(
                ConfigurationInstance::new("retrying", json!({}))
                    .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(5)))
            )))
        ));
        assert!(build(
            configured,
            Some(Arc::new(DynamicConfigurationProvider::new(
                |_| Ok("k".to_string()),
                |key| Ok(ConfigurationInstance::new(key, json!({}))),
            )))
        ));

        let forced = ComponentMessageProcessor::builder(model(), async_upper())
            .completes_asynchronously(true)
            .build()
            .unwrap();
        assert!(forced.may_complete_in_different_thread());
    }

    #[tokio::test]
    async fn test_provider_without_static_instance_may_complete_elsewhere() {
        struct Opaque;
        impl ConfigurationProvider for Opaque {
            fn get(&self, _event: &Event) -> anyhow::Result<Arc<ConfigurationInstance>> {
                Ok(Arc::new(ConfigurationInstance::new("opaque", json!({}))))
            }

            fn is_dynamic(&self) -> bool {
                false
            }
        }

        let processor =
            ComponentMessageProcessor::builder(model().with_requires_config(true), upper())
                .with_configuration_provider(Arc::new(Opaque))
                .build()
                .unwrap();
        assert!(processor.may_complete_in_different_thread());
    }

    #[test]
    fn test_processing_type_reporting() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let schedulers = Schedulers::uniform(runtime.handle().clone());
        let processor = |ty| {
            ComponentMessageProcessor::builder(model().with_processing_type(ty), upper())
                .with_schedulers(schedulers.clone())
                .build()
                .unwrap()
        };

        let lite = processor(ProcessingType::CpuLite);
        assert_eq!(lite.processing_type(), ProcessingType::CpuLite);
        assert_eq!(lite.inner_processing_type(), ProcessingType::CpuLiteAsync);

        let blocking = processor(ProcessingType::Blocking);
        assert_eq!(blocking.processing_type(), ProcessingType::CpuLite);
        assert_eq!(blocking.inner_processing_type(), ProcessingType::Blocking);

        let intensive = processor(ProcessingType::CpuIntensive);
        assert_eq!(intensive.inner_processing_type(), ProcessingType::CpuIntensive);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_component_runs_off_the_caller() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let executor = Arc::new(FnExecutor::new(move |_| {
            *recorder.lock().unwrap() = Some(std::thread::current().id());
            Ok(ComponentOutput::value("done"))
        }));
        let processor = ComponentMessageProcessor::builder(
            model().with_processing_type(ProcessingType::Blocking),
            executor,
        )
        .build()
        .unwrap();

        processor.process(Event::of("x")).await.unwrap();
        let executed_on = seen.lock().unwrap().expect("executor ran");
        assert_ne!(executed_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_diagnostic_context_on_executing_thread() {
        let executor = Arc::new(FnExecutor::new(|_| {
            Ok(ComponentOutput::value(json!({
                "correlation": mdc::get(mdc::CORRELATION_ID_KEY),
                "path": mdc::get(mdc::PROCESSOR_PATH_KEY),
            })))
        }));
        let processor = ComponentMessageProcessor::builder(model(), executor)
            .with_location(location())
            .build()
            .unwrap();

        let event = Event::new(EventContext::with_correlation("corr-1"), Message::of("x"));
        let out = processor.process(event).await.unwrap();
        assert_eq!(
            out.message().payload().as_json(),
            Some(&json!({"correlation": "corr-1", "path": "flow/processors/0"}))
        );
        assert!(mdc::get(mdc::CORRELATION_ID_KEY).is_none());
        assert!(mdc::get(mdc::PROCESSOR_PATH_KEY).is_none());
    }

    #[tokio::test]
    async fn test_start_failure_reported_per_event() {
        struct Broken;
        impl ComponentExecutor for Broken {
            fn execute(&self, _ctx: Arc<ExecutionContext>, callback: ExecutorCallback) {
                callback.complete(ComponentOutput::Void);
            }

            fn start(&self) -> anyhow::Result<()> {
                anyhow::bail!("no credentials")
            }
        }
        let processor = ComponentMessageProcessor::builder(model(), Arc::new(Broken))
            .build()
            .unwrap();

        assert!(matches!(processor.start(), Err(EngineError::Lifecycle { .. })));
        let err = processor.process(Event::of("x")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Lifecycle);
    }

    #[tokio::test]
    async fn test_apply_emits_one_item_per_event_in_order() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .build()
            .unwrap();
        let events = ["a", "bad", "c", "d"].map(Event::of);

        let items: Vec<_> = processor.apply(futures::stream::iter(events)).collect().await;

        assert_eq!(items.len(), 4);
        let payloads: Vec<_> = items
            .iter()
            .map(|item| match item {
                Ok(event) => event.message().payload().as_str().unwrap_or("").to_string(),
                Err(failure) => format!("error:{}", failure.event().message().payload().as_str().unwrap_or("")),
            })
            .collect();
        assert_eq!(payloads, vec!["A", "error:bad", "C", "D"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_component_keeps_upstream_order() {
        let executor = Arc::new(FnExecutor::new(|ctx| {
            let payload = ctx.event().message().payload().as_str().unwrap_or("").to_string();
            if payload == "slow" {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(ComponentOutput::value(payload.to_uppercase()))
        }));
        let processor = ComponentMessageProcessor::builder(
            model().with_processing_type(ProcessingType::Blocking),
            executor,
        )
        .build()
        .unwrap();
        assert!(!processor.may_complete_in_different_thread());

        let events = ["slow", "fast"].map(Event::of);
        let outcomes = collect_outcomes(processor.apply(futures::stream::iter(events))).await;

        assert!(outcomes.failed.is_empty());
        assert_eq!(outcomes.payloads(), vec!["SLOW", "FAST"]);
    }

    #[tokio::test]
    async fn test_resubscription_starts_fresh_inner_pipelines() {
        let processor = ComponentMessageProcessor::builder(model(), async_upper())
            .completes_asynchronously(true)
            .with_config(EngineConfig::default().with_concurrency(3))
            .build()
            .unwrap();

        let first: Vec<_> = processor
            .apply(futures::stream::iter(["a", "b"].map(Event::of)))
            .collect()
            .await;
        assert_eq!(first.len(), 2);
        assert_eq!(processor.inner_generation(), 1);
        wait_until(|| processor.inner_pipeline_count() == 0).await;

        let second: Vec<_> = processor
            .apply(futures::stream::iter(["c", "d", "e"].map(Event::of)))
            .collect()
            .await;
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(Result::is_ok));
        assert_eq!(processor.inner_generation(), 2);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_subscription() {
        let processor = ComponentMessageProcessor::builder(model(), async_upper())
            .completes_asynchronously(true)
            .build()
            .unwrap();
        let upstream = futures::stream::iter([Event::of("first")]).chain(futures::stream::pending());

        let mut stream = processor.apply(upstream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message().payload().as_str(), Some("FIRST"));
        assert_eq!(processor.active_subscriptions(), 1);
        assert!(processor.inner_pipeline_count() > 0);

        drop(stream);
        wait_until(|| processor.active_subscriptions() == 0).await;
        assert_eq!(processor.inner_pipeline_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_timeout_abandons_stragglers() {
        let parked: Arc<Mutex<Vec<ExecutorCallback>>> = Arc::default();
        struct Parking(Arc<Mutex<Vec<ExecutorCallback>>>);
        impl ComponentExecutor for Parking {
            fn execute(&self, _ctx: Arc<ExecutionContext>, callback: ExecutorCallback) {
                self.0.lock().unwrap().push(callback);
            }
        }
        let processor = ComponentMessageProcessor::builder(model(), Arc::new(Parking(parked.clone())))
            .completes_asynchronously(true)
            .with_config(
                EngineConfig::default()
                    .with_outer_termination_timeout(Some(Duration::from_millis(100))),
            )
            .build()
            .unwrap();

        let items: Vec<_> = processor
            .apply(futures::stream::iter([Event::of("slow")]))
            .collect()
            .await;
        assert!(items.is_empty());

        for callback in parked.lock().unwrap().drain(..) {
            callback.complete(ComponentOutput::value("too late"));
        }
    }

    #[tokio::test]
    async fn test_processor_as_chain_step() {
        let processor = ComponentMessageProcessor::builder(model(), upper())
            .with_resolvers(ResolverSet::new().add("payload", PayloadResolver))
            .build()
            .unwrap();
        let chain = crate::chain::MessageProcessorChain::new("route")
            .then(processor.clone())
            .then(processor);

        let out = chain.run(Event::of("abc")).await.unwrap();
        assert_eq!(out.message().payload().as_str(), Some("ABC"));
    }
}
