//! Execution mediator: drives one executor through its lifecycle and
//! invocations.
//!
//! The mediator owns the executor and guarantees, for every call to
//! [`ExecutionMediator::execute`], that exactly one outcome reaches the
//! caller's callback:
//!
//! ```text
//! execute(ctx, cb)
//!   │ admit: lazily initialise + start (once, under the write lock),
//!   │        reject if stopping/stopped; count as in flight
//!   ▼
//! interceptors.before ──err──► cb.error
//!   │ ok
//!   ▼
//! executor.execute(ctx, wrapped)   (module scope entered, panics caught)
//!   │
//!   ▼ wrapped fires (any thread)
//! on_success/after ─► cb.complete        on_error/after ─► retry? ─► cb.error
//! ```
//!
//! # Shutdown
//!
//! `stop` flips the state first, so no invocation begins afterwards. In
//! [`ShutdownMode::Graceful`] it then waits (bounded by the termination
//! timeout) for in-flight invocations; anything still running when the
//! timeout expires, and everything in [`ShutdownMode::Immediate`], is
//! abandoned: late callbacks are discarded instead of delivered.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::component::ComponentModel;
use crate::configuration::InvocationTracker;
use crate::connection::ConnectionError;
use crate::context::ExecutionContext;
use crate::error::{panic_message, EngineError};
use crate::exec_scope;
use crate::executor::{Callback, ComponentExecutor, ComponentOutput, ExecutorCallback};
use crate::inflight::{InflightCounter, InflightGuard};
use crate::interceptor::InterceptorChain;
use crate::lifecycle::LifecycleState;

/// Default bound on how long a graceful stop waits for in-flight work.
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How `stop` treats in-flight invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Wait for in-flight invocations, up to the termination timeout.
    #[default]
    Graceful,
    /// Abandon in-flight invocations immediately.
    Immediate,
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graceful" => Ok(ShutdownMode::Graceful),
            "immediate" => Ok(ShutdownMode::Immediate),
            other => Err(format!("unknown shutdown mode '{other}'")),
        }
    }
}

/// Keeps an invocation counted until its outcome was forwarded.
struct Ticket {
    /// Run the invocation was admitted in.
    epoch: u64,
    _inflight: InflightGuard,
    _stats: Option<InvocationTracker>,
}

struct MediatorInner {
    component: ComponentModel,
    executor: Arc<dyn ComponentExecutor>,
    interceptors: InterceptorChain,
    state: RwLock<LifecycleState>,
    inflight: Arc<InflightCounter>,
    /// Incremented by every successful `start`.
    run_epoch: AtomicU64,
    /// Runs up to and including this one were abandoned by a stop.
    abandoned_epoch: AtomicU64,
    termination_timeout: Duration,
}

/// Mediates every invocation of one executor.
///
/// Cheap to clone; clones share the executor and lifecycle state.
#[derive(Clone)]
pub struct ExecutionMediator {
    inner: Arc<MediatorInner>,
}

/// Builder for [`ExecutionMediator`].
pub struct ExecutionMediatorBuilder {
    component: ComponentModel,
    executor: Arc<dyn ComponentExecutor>,
    interceptors: InterceptorChain,
    termination_timeout: Duration,
}

impl ExecutionMediatorBuilder {
    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn build(self) -> ExecutionMediator {
        ExecutionMediator {
            inner: Arc::new(MediatorInner {
                component: self.component,
                executor: self.executor,
                interceptors: self.interceptors,
                state: RwLock::new(LifecycleState::Created),
                inflight: Arc::new(InflightCounter::new()),
                run_epoch: AtomicU64::new(0),
                abandoned_epoch: AtomicU64::new(0),
                termination_timeout: self.termination_timeout,
            }),
        }
    }
}

impl ExecutionMediator {
    pub fn builder(
        component: ComponentModel,
        executor: Arc<dyn ComponentExecutor>,
    ) -> ExecutionMediatorBuilder {
        ExecutionMediatorBuilder {
            component,
            executor,
            interceptors: InterceptorChain::new(),
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
        }
    }

    pub fn component(&self) -> &ComponentModel {
        &self.inner.component
    }

    pub fn state(&self) -> LifecycleState {
        *self.read_state()
    }

    /// Invocations admitted and not yet forwarded.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.count()
    }

    /// True once the current run was abandoned by a non-graceful stop, so
    /// its late results are discarded.
    pub fn is_discarding(&self) -> bool {
        let run = self.inner.run_epoch.load(Ordering::Acquire);
        run > 0 && self.inner.abandoned_epoch.load(Ordering::Acquire) >= run
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initialise the executor. Idempotent.
    pub fn initialise(&self) -> Result<(), EngineError> {
        let mut state = self.write_state();
        self.initialise_locked(&mut state)
    }

    /// Initialise (if needed) and start the executor. Idempotent while
    /// started.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.write_state();
        if *state == LifecycleState::Started {
            return Ok(());
        }
        self.initialise_locked(&mut state)?;
        self.transition(&state, LifecycleState::Started)?;
        if let Err(source) = self.inner.executor.start() {
            *state = LifecycleState::Failed;
            return Err(self.lifecycle_error("start", source));
        }
        *state = LifecycleState::Started;
        self.inner.run_epoch.fetch_add(1, Ordering::AcqRel);
        info!(component = %self.inner.component.name(), "executor started");
        Ok(())
    }

    /// Stop accepting invocations, then drain or abandon in-flight ones
    /// according to `mode`, then stop the executor.
    pub async fn stop(&self, mode: ShutdownMode) -> Result<(), EngineError> {
        let epoch = {
            let mut state = self.write_state();
            match *state {
                LifecycleState::Started => {
                    *state = LifecycleState::Stopped;
                    self.inner.run_epoch.load(Ordering::Acquire)
                }
                LifecycleState::Stopped
                | LifecycleState::Created
                | LifecycleState::Initialised => return Ok(()),
                other => {
                    return Err(EngineError::IllegalTransition {
                        component: self.inner.component.name().to_string(),
                        from: other,
                        to: LifecycleState::Stopped,
                    })
                }
            }
        };

        let pending = self.inflight();
        match mode {
            ShutdownMode::Graceful => {
                let timeout = self.inner.termination_timeout;
                if !self.inner.inflight.wait_zero_timeout(timeout).await {
                    warn!(
                        component = %self.inner.component.name(),
                        inflight = self.inflight(),
                        timeout_ms = timeout.as_millis() as u64,
                        "termination timeout elapsed, abandoning in-flight invocations"
                    );
                    self.abandon(epoch);
                }
            }
            ShutdownMode::Immediate => {
                if pending > 0 {
                    info!(
                        component = %self.inner.component.name(),
                        inflight = pending,
                        "immediate stop, abandoning in-flight invocations"
                    );
                }
                self.abandon(epoch);
            }
        }

        self.inner
            .executor
            .stop()
            .map_err(|source| self.lifecycle_error("stop", source))?;
        info!(component = %self.inner.component.name(), "executor stopped");
        Ok(())
    }

    /// Discard late results of every invocation admitted up to `epoch`,
    /// even if the mediator is restarted before they complete.
    fn abandon(&self, epoch: u64) {
        self.inner.abandoned_epoch.fetch_max(epoch, Ordering::AcqRel);
    }

    /// Dispose the executor. Only legal when not started.
    pub fn dispose(&self) -> Result<(), EngineError> {
        let mut state = self.write_state();
        match *state {
            LifecycleState::Disposed | LifecycleState::Failed => Ok(()),
            current => {
                self.transition(&state, LifecycleState::Disposed)?;
                debug!(component = %self.inner.component.name(), from = %current, "disposing executor");
                self.inner.executor.dispose();
                *state = LifecycleState::Disposed;
                Ok(())
            }
        }
    }

    fn initialise_locked(&self, state: &mut RwLockWriteGuard<'_, LifecycleState>) -> Result<(), EngineError> {
        match **state {
            LifecycleState::Created => {
                if let Err(source) = self.inner.executor.initialise() {
                    **state = LifecycleState::Failed;
                    return Err(self.lifecycle_error("initialise", source));
                }
                **state = LifecycleState::Initialised;
                Ok(())
            }
            LifecycleState::Initialised | LifecycleState::Started | LifecycleState::Stopped => Ok(()),
            other => Err(EngineError::NotRunning {
                component: self.inner.component.name().to_string(),
                state: other,
            }),
        }
    }

    fn transition(&self, state: &LifecycleState, to: LifecycleState) -> Result<(), EngineError> {
        if state.can_transition_to(to) {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                component: self.inner.component.name().to_string(),
                from: *state,
                to,
            })
        }
    }

    fn lifecycle_error(&self, phase: &'static str, source: anyhow::Error) -> EngineError {
        warn!(
            component = %self.inner.component.name(),
            phase,
            error = %source,
            "executor lifecycle phase failed"
        );
        EngineError::Lifecycle {
            component: self.inner.component.name().to_string(),
            phase,
            source,
        }
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Invoke the executor. Never panics or returns an error: every failure
    /// is delivered through `callback`.
    pub fn execute(&self, context: Arc<ExecutionContext>, callback: ExecutorCallback) {
        let (epoch, inflight) = match self.admit() {
            Ok(admitted) => admitted,
            Err(error) => {
                callback.error(error);
                return;
            }
        };
        let ticket = Ticket {
            epoch,
            _inflight: inflight,
            _stats: context.configuration().map(|c| c.stats().track()),
        };
        self.invoke(context, callback, ticket, 0);
    }

    /// Admit an invocation: start lazily, reject once stopping began.
    ///
    /// The in-flight count is taken under the read lock, so `stop` (which
    /// takes the write lock) either sees it or rejects the invocation.
    fn admit(&self) -> Result<(u64, InflightGuard), EngineError> {
        {
            let state = self.read_state();
            if state.accepts_invocations() {
                return Ok(self.admitted());
            }
            if !matches!(*state, LifecycleState::Created | LifecycleState::Initialised) {
                return Err(self.not_running(*state));
            }
        }
        self.start()?;
        let state = self.read_state();
        if state.accepts_invocations() {
            Ok(self.admitted())
        } else {
            Err(self.not_running(*state))
        }
    }

    /// Caller holds the state read lock, so the epoch cannot move.
    fn admitted(&self) -> (u64, InflightGuard) {
        (
            self.inner.run_epoch.load(Ordering::Acquire),
            self.inner.inflight.guard(),
        )
    }

    fn invoke(
        &self,
        context: Arc<ExecutionContext>,
        callback: ExecutorCallback,
        ticket: Ticket,
        attempt: u32,
    ) {
        if let Err(error) = self.inner.interceptors.before(&context) {
            self.forward(&ticket, &callback, Err(error));
            return;
        }

        let wrapped: ExecutorCallback = {
            let mediator = self.clone();
            let context = context.clone();
            Callback::new(move |outcome| {
                mediator.on_outcome(context, outcome, callback, ticket, attempt)
            })
        };

        let _module = exec_scope::enter(Some(self.inner.component.module().clone()));
        let executor = self.inner.executor.clone();
        let handed = wrapped.clone();
        if let Err(panic) =
            std::panic::catch_unwind(AssertUnwindSafe(move || executor.execute(context, handed)))
        {
            let message = panic_message(panic.as_ref());
            warn!(component = %self.inner.component.name(), panic = %message, "executor panicked");
            wrapped.error(EngineError::ExecutorPanicked { message });
        }
    }

    fn on_outcome(
        &self,
        context: Arc<ExecutionContext>,
        outcome: Result<ComponentOutput, anyhow::Error>,
        callback: ExecutorCallback,
        ticket: Ticket,
        attempt: u32,
    ) {
        match outcome {
            Ok(output) => {
                self.inner.interceptors.on_success(&context, &output);
                self.forward(&ticket, &callback, Ok(output));
            }
            Err(error) => {
                let error = self.inner.interceptors.on_error(&context, error);
                match self.retry_delay(&context, &error, attempt) {
                    Some(delay) => self.schedule_retry(context, callback, ticket, attempt, delay, error),
                    None => self.forward(&ticket, &callback, Err(error)),
                }
            }
        }
    }

    fn retry_delay(
        &self,
        context: &ExecutionContext,
        error: &anyhow::Error,
        attempt: u32,
    ) -> Option<Duration> {
        let policy = context.configuration()?.retry_policy();
        let retry = policy.is_enabled()
            && attempt < policy.max_retries()
            && ConnectionError::is_connection_error(error)
            && self.state().accepts_invocations();
        retry.then_some(policy.delay())
    }

    fn schedule_retry(
        &self,
        context: Arc<ExecutionContext>,
        callback: ExecutorCallback,
        ticket: Ticket,
        attempt: u32,
        delay: Duration,
        error: anyhow::Error,
    ) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.forward(&ticket, &callback, Err(error));
                return;
            }
        };
        debug!(
            component = %self.inner.component.name(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying invocation after connection error"
        );
        let mediator = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if mediator.state().accepts_invocations() {
                mediator.invoke(context, callback, ticket, attempt + 1);
            } else {
                mediator.forward(&ticket, &callback, Err(error));
            }
        });
    }

    fn forward(
        &self,
        ticket: &Ticket,
        callback: &ExecutorCallback,
        outcome: Result<ComponentOutput, anyhow::Error>,
    ) {
        if ticket.epoch <= self.inner.abandoned_epoch.load(Ordering::Acquire) {
            debug!(
                component = %self.inner.component.name(),
                epoch = ticket.epoch,
                "discarding result of abandoned invocation"
            );
            callback.discard();
            return;
        }
        callback.deliver(outcome);
    }

    fn not_running(&self, state: LifecycleState) -> EngineError {
        EngineError::NotRunning {
            component: self.inner.component.name().to_string(),
            state,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LifecycleState> {
        match self.inner.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LifecycleState> {
        match self.inner.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for ExecutionMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionMediator")
            .field("component", &self.inner.component.name())
            .field("state", &self.state())
            .field("inflight", &self.inflight())
            .field("interceptors", &self.inner.interceptors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{ConfigurationInstance, RetryPolicy};
    use crate::connection::FnConnectionProvider;
    use crate::event::Event;
    use crate::executor::FnExecutor;
    use crate::interceptor::{ConnectionInterceptor, Interceptor};
    use crate::resolver::ResolverSetResult;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    type Outcome = Result<ComponentOutput, String>;

    fn capture() -> (ExecutorCallback, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let callback = Callback::new(move |outcome: anyhow::Result<ComponentOutput>| {
            let _ = tx.send(outcome.map_err(|e| format!("{e:#}")));
        });
        (callback, rx)
    }

    fn context() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::for_event(Event::of("in")))
    }

    fn model() -> ComponentModel {
        ComponentModel::new("test:op", "test-module")
    }

    /// Executor that records lifecycle calls and parks callbacks until
    /// released.
    #[derive(Default)]
    struct Lifecycled {
        log: Mutex<Vec<&'static str>>,
        fail_start: bool,
        executions: AtomicUsize,
        parked: Mutex<Vec<ExecutorCallback>>,
        park: bool,
    }

    impl Lifecycled {
        fn release_all(&self) {
            for callback in self.parked.lock().unwrap().drain(..) {
                callback.complete(ComponentOutput::value("late"));
            }
        }
    }

    impl ComponentExecutor for Lifecycled {
        fn execute(&self, _ctx: Arc<ExecutionContext>, callback: ExecutorCallback) {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.park {
                self.parked.lock().unwrap().push(callback);
            } else {
                callback.complete(ComponentOutput::value(
                    exec_scope::current_module()
                        .map(|m| m.to_string())
                        .unwrap_or_default(),
                ));
            }
        }

        fn initialise(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("initialise");
            Ok(())
        }

        fn start(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("start");
            if self.fail_start {
                anyhow::bail!("cannot bind port");
            }
            Ok(())
        }

        fn stop(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("stop");
            Ok(())
        }

        fn dispose(&self) {
            self.log.lock().unwrap().push("dispose");
        }
    }

    #[tokio::test]
    async fn test_lazy_start_happens_once() {
        let executor = Arc::new(Lifecycled::default());
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();

        for _ in 0..3 {
            let (callback, rx) = capture();
            mediator.execute(context(), callback);
            let output = rx.await.unwrap().unwrap();
            assert_eq!(output, ComponentOutput::value("test-module"));
        }

        assert_eq!(*executor.log.lock().unwrap(), vec!["initialise", "start"]);
        assert_eq!(mediator.state(), LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let executor = Arc::new(Lifecycled {
            fail_start: true,
            ..Default::default()
        });
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();

        let err = mediator.start().unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle { phase: "start", .. }));
        assert_eq!(mediator.state(), LifecycleState::Failed);

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.contains("failed"), "got: {err}");
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_invocations() {
        let executor = Arc::new(Lifecycled::default());
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();
        mediator.start().unwrap();
        mediator.stop(ShutdownMode::Graceful).await.unwrap();

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.contains("stopped"), "got: {err}");
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);

        mediator.dispose().unwrap();
        assert_eq!(
            *executor.log.lock().unwrap(),
            vec!["initialise", "start", "stop", "dispose"]
        );
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_inflight() {
        let executor = Arc::new(Lifecycled {
            park: true,
            ..Default::default()
        });
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        assert_eq!(mediator.inflight(), 1);

        let stopping = {
            let mediator = mediator.clone();
            tokio::spawn(async move { mediator.stop(ShutdownMode::Graceful).await })
        };
        tokio::task::yield_now().await;
        executor.release_all();

        stopping.await.unwrap().unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), ComponentOutput::value("late"));
        assert_eq!(mediator.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_timeout_abandons_inflight() {
        let executor = Arc::new(Lifecycled {
            park: true,
            ..Default::default()
        });
        let mediator = ExecutionMediator::builder(model(), executor.clone())
            .with_termination_timeout(Duration::from_millis(100))
            .build();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        mediator.execute(
            context(),
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        mediator.stop(ShutdownMode::Graceful).await.unwrap();
        assert!(mediator.is_discarding());

        executor.release_all();
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(mediator.inflight(), 0);
    }

    #[tokio::test]
    async fn test_immediate_stop_discards_late_callbacks() {
        let executor = Arc::new(Lifecycled {
            park: true,
            ..Default::default()
        });
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        mediator.execute(
            context(),
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mediator.stop(ShutdownMode::Immediate).await.unwrap();

        executor.release_all();
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let executor = Arc::new(Lifecycled::default());
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();
        mediator.start().unwrap();
        mediator.stop(ShutdownMode::Immediate).await.unwrap();
        mediator.start().unwrap();
        assert!(!mediator.is_discarding());

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_results_stay_discarded_after_restart() {
        let executor = Arc::new(Lifecycled {
            park: true,
            ..Default::default()
        });
        let mediator = ExecutionMediator::builder(model(), executor.clone()).build();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        mediator.execute(
            context(),
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mediator.stop(ShutdownMode::Immediate).await.unwrap();
        mediator.start().unwrap();
        assert!(!mediator.is_discarding());

        // Completes after the restart; it still belongs to the abandoned run.
        executor.release_all();
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(mediator.inflight(), 0);

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        executor.release_all();
        assert_eq!(rx.await.unwrap().unwrap(), ComponentOutput::value("late"));
    }

    #[tokio::test]
    async fn test_panicking_executor_reports_error_once() {
        let executor = Arc::new(FnExecutor::new(|_| panic!("executor blew up")));
        let mediator = ExecutionMediator::builder(model(), executor).build();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        mediator.execute(
            context(),
            Callback::new(move |outcome: anyhow::Result<ComponentOutput>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome.map_err(|e| e.to_string()));
            }),
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.contains("executor blew up"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executor_dropping_callback_reports_error() {
        struct Forgetful;
        impl ComponentExecutor for Forgetful {
            fn execute(&self, _ctx: Arc<ExecutionContext>, callback: ExecutorCallback) {
                drop(callback);
            }
        }
        let mediator = ExecutionMediator::builder(model(), Arc::new(Forgetful)).build();

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.contains("dropped"), "got: {err}");
    }

    #[tokio::test]
    async fn test_failing_before_skips_executor() {
        struct Reject;
        impl Interceptor for Reject {
            fn before(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
                anyhow::bail!("rejected by interceptor")
            }
        }
        let executor = Arc::new(Lifecycled::default());
        let mediator = ExecutionMediator::builder(model(), executor.clone())
            .with_interceptors(InterceptorChain::new().with(Reject))
            .build();

        let (callback, rx) = capture();
        mediator.execute(context(), callback);
        assert_eq!(rx.await.unwrap().unwrap_err(), "rejected by interceptor");
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_are_retried() {
        let provider = Arc::new(FnConnectionProvider::new(|| {
            Ok::<_, ConnectionError>(())
        }));
        let config = Arc::new(
            ConfigurationInstance::new("cfg", serde_json::json!({}))
                .with_connection_provider(provider.clone())
                .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(10))),
        );
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let executor = Arc::new(FnExecutor::new(move |ctx| {
            assert!(ctx.connection::<()>().is_some());
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(ConnectionError::new("connection reset").into());
            }
            Ok(ComponentOutput::value("ok"))
        }));
        let mediator = ExecutionMediator::builder(model(), executor)
            .with_interceptors(InterceptorChain::new().with(ConnectionInterceptor))
            .build();

        let ctx = Arc::new(ExecutionContext::new(
            model().with_requires_config(true),
            None,
            Some(config.clone()),
            ResolverSetResult::new(),
            Event::of("x"),
        ));
        let (callback, rx) = capture();
        mediator.execute(ctx, callback);

        assert_eq!(rx.await.unwrap().unwrap(), ComponentOutput::value("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(provider.invalidated(), 2);
        assert_eq!(provider.active(), 0);
        assert_eq!(config.stats().completed(), 1);
        assert_eq!(config.stats().inflight(), 0);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let config = Arc::new(
            ConfigurationInstance::new("cfg", serde_json::json!({}))
                .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1))),
        );
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let executor = Arc::new(FnExecutor::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("validation failed"))
        }));
        let mediator = ExecutionMediator::builder(model(), executor).build();
        let ctx = Arc::new(ExecutionContext::new(
            model(),
            None,
            Some(config),
            ResolverSetResult::new(),
            Event::of("x"),
        ));

        let (callback, rx) = capture();
        mediator.execute(ctx, callback);
        assert_eq!(rx.await.unwrap().unwrap_err(), "validation failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
