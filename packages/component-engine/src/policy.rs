//! Operation policies: interception around component execution.
//!
//! A policy receives the event, the raw execution function and the
//! continuation callback, and decides whether and where the execution
//! happens:
//!
//! ```text
//!              ┌──────────── OperationPolicy ────────────┐
//! event ──►    │ run now / hop to a pool / skip (synth.)  │ ──► callback (exactly once)
//!              │        └──► execution(event, cb) ───────┘
//!              └──────────────────────────────────────────┘
//! ```
//!
//! Absence of a policy is [`ResolvedPolicy::NoPolicy`]: a pure pass-through
//! that invokes the execution function inline, on the calling thread.
//! Components without a location never reach the policy manager at all.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::component::{ComponentLocation, ComponentModel};
use crate::event::Event;
use crate::executor::{Callback, EventCallback};
use crate::resolver::ResolverSetResult;

/// Runs the component for an event and signals the callback once.
///
/// `Fn` rather than `FnOnce`: policies may execute more than once (retry).
pub type OperationExecutionFunction = Arc<dyn Fn(Event, EventCallback) + Send + Sync>;

/// Gives policies access to the resolved operation parameters.
pub type ParametersProcessor = Arc<dyn Fn() -> ResolverSetResult + Send + Sync>;

/// An interceptor around one operation invocation.
pub trait OperationPolicy: Send + Sync + 'static {
    /// Decide whether and when to call `execution`. Must eventually signal
    /// `callback` exactly once.
    fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        parameters: ParametersProcessor,
        location: &ComponentLocation,
        callback: EventCallback,
    );
}

/// The policy that applies to an invocation.
#[derive(Clone)]
pub enum ResolvedPolicy {
    NoPolicy,
    Policy(Arc<dyn OperationPolicy>),
}

impl ResolvedPolicy {
    pub fn is_no_policy(&self) -> bool {
        matches!(self, ResolvedPolicy::NoPolicy)
    }

    /// Apply the policy. `NoPolicy` calls `execution` inline.
    pub fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        parameters: ParametersProcessor,
        location: &ComponentLocation,
        callback: EventCallback,
    ) {
        match self {
            ResolvedPolicy::NoPolicy => execution(event, callback),
            ResolvedPolicy::Policy(policy) => {
                policy.process(event, execution, parameters, location, callback)
            }
        }
    }
}

impl fmt::Debug for ResolvedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedPolicy::NoPolicy => write!(f, "NoPolicy"),
            ResolvedPolicy::Policy(_) => write!(f, "Policy"),
        }
    }
}

// =============================================================================
// Policy Managers
// =============================================================================

/// Decides which policy applies to a component invocation.
pub trait PolicyManager: Send + Sync + 'static {
    fn create_operation_policy(
        &self,
        component: &ComponentModel,
        location: &ComponentLocation,
        event: &Event,
        parameters: &ParametersProcessor,
    ) -> ResolvedPolicy;
}

/// Never applies a policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPolicyManager;

impl PolicyManager for NoPolicyManager {
    fn create_operation_policy(
        &self,
        _component: &ComponentModel,
        _location: &ComponentLocation,
        _event: &Event,
        _parameters: &ParametersProcessor,
    ) -> ResolvedPolicy {
        ResolvedPolicy::NoPolicy
    }
}

type Pointcut = dyn Fn(&ComponentModel, &ComponentLocation) -> bool + Send + Sync;

struct PolicyRegistration {
    name: String,
    pointcut: Box<Pointcut>,
    policy: Arc<dyn OperationPolicy>,
}

/// Policies registered with pointcuts, resolved and cached per location.
///
/// When several policies match a location they are composed in
/// registration order, the first registered being the outermost. The cache
/// is cleared whenever registrations change.
#[derive(Default)]
pub struct DefaultPolicyManager {
    registrations: RwLock<Vec<PolicyRegistration>>,
    cache: DashMap<String, ResolvedPolicy>,
    lookups: AtomicU64,
    resolutions: AtomicU64,
}

impl DefaultPolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `policy` for every component the pointcut matches.
    pub fn register<P>(&self, name: impl Into<String>, pointcut: P, policy: Arc<dyn OperationPolicy>)
    where
        P: Fn(&ComponentModel, &ComponentLocation) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        info!(policy = %name, "registering operation policy");
        self.write_registrations().push(PolicyRegistration {
            name,
            pointcut: Box::new(pointcut),
            policy,
        });
        self.cache.clear();
    }

    /// Remove a policy by name. Returns true if one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut registrations = self.write_registrations();
            let before = registrations.len();
            registrations.retain(|r| r.name != name);
            registrations.len() != before
        };
        if removed {
            info!(policy = %name, "unregistered operation policy");
            self.cache.clear();
        }
        removed
    }

    /// Number of `create_operation_policy` calls.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Acquire)
    }

    /// Number of lookups that had to evaluate pointcuts (cache misses).
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::Acquire)
    }

    fn resolve(&self, component: &ComponentModel, location: &ComponentLocation) -> ResolvedPolicy {
        self.resolutions.fetch_add(1, Ordering::AcqRel);
        let registrations = match self.registrations.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matching: Vec<Arc<dyn OperationPolicy>> = registrations
            .iter()
            .filter(|r| (r.pointcut)(component, location))
            .map(|r| r.policy.clone())
            .collect();
        debug!(
            location = %location,
            policies = matching.len(),
            "resolved operation policies"
        );
        match matching.len() {
            0 => ResolvedPolicy::NoPolicy,
            1 => ResolvedPolicy::Policy(matching.remove(0)),
            _ => ResolvedPolicy::Policy(Arc::new(CompositeOperationPolicy::new(matching))),
        }
    }

    fn write_registrations(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PolicyRegistration>> {
        match self.registrations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PolicyManager for DefaultPolicyManager {
    fn create_operation_policy(
        &self,
        component: &ComponentModel,
        location: &ComponentLocation,
        _event: &Event,
        _parameters: &ParametersProcessor,
    ) -> ResolvedPolicy {
        self.lookups.fetch_add(1, Ordering::AcqRel);
        let key = location.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let resolved = self.resolve(component, location);
        self.cache.insert(key, resolved.clone());
        resolved
    }
}

impl fmt::Debug for DefaultPolicyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = match self.registrations.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        f.debug_struct("DefaultPolicyManager")
            .field("registered", &registered)
            .field("cached", &self.cache.len())
            .field("lookups", &self.lookup_count())
            .finish()
    }
}

// =============================================================================
// Stock Policies
// =============================================================================

/// Nests several policies, the first being the outermost.
pub struct CompositeOperationPolicy {
    policies: Vec<Arc<dyn OperationPolicy>>,
}

impl CompositeOperationPolicy {
    pub fn new(policies: Vec<Arc<dyn OperationPolicy>>) -> Self {
        Self { policies }
    }
}

impl OperationPolicy for CompositeOperationPolicy {
    fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        parameters: ParametersProcessor,
        location: &ComponentLocation,
        callback: EventCallback,
    ) {
        let mut next = execution;
        for policy in self.policies.iter().skip(1).rev() {
            let inner = next;
            let policy = policy.clone();
            let parameters = parameters.clone();
            let location = location.clone();
            next = Arc::new(move |event: Event, callback: EventCallback| {
                policy.process(event, inner.clone(), parameters.clone(), &location, callback)
            });
        }
        match self.policies.first() {
            Some(first) => first.process(event, next, parameters, location, callback),
            None => next(event, callback),
        }
    }
}

/// Moves execution and/or continuation onto other runtimes.
#[derive(Debug, Clone, Default)]
pub struct ThreadSwitchPolicy {
    before: Option<Handle>,
    after: Option<Handle>,
}

impl ThreadSwitchPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the execution function on `handle`.
    pub fn before(mut self, handle: Handle) -> Self {
        self.before = Some(handle);
        self
    }

    /// Deliver the continuation on `handle`.
    pub fn after(mut self, handle: Handle) -> Self {
        self.after = Some(handle);
        self
    }
}

impl OperationPolicy for ThreadSwitchPolicy {
    fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        _parameters: ParametersProcessor,
        _location: &ComponentLocation,
        callback: EventCallback,
    ) {
        let callback = match &self.after {
            Some(handle) => {
                let handle = handle.clone();
                Callback::new(move |outcome| {
                    handle.spawn(async move {
                        callback.deliver(outcome);
                    });
                })
            }
            None => callback,
        };
        match &self.before {
            Some(handle) => {
                handle.spawn(async move { execution(event, callback) });
            }
            None => execution(event, callback),
        }
    }
}

type ShortCircuit = dyn Fn(&Event) -> Option<anyhow::Result<Event>> + Send + Sync;

/// Skips execution when the decision function produces a result.
pub struct ShortCircuitPolicy {
    decide: Box<ShortCircuit>,
}

impl ShortCircuitPolicy {
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&Event) -> Option<anyhow::Result<Event>> + Send + Sync + 'static,
    {
        Self {
            decide: Box::new(decide),
        }
    }
}

impl OperationPolicy for ShortCircuitPolicy {
    fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        _parameters: ParametersProcessor,
        location: &ComponentLocation,
        callback: EventCallback,
    ) {
        match (self.decide)(&event) {
            Some(outcome) => {
                debug!(location = %location, "policy short-circuited execution");
                callback.deliver(outcome);
            }
            None => execution(event, callback),
        }
    }
}

/// Re-runs the execution function when it fails.
#[derive(Debug, Clone, Copy)]
pub struct RetryingPolicy {
    max_retries: u32,
}

impl RetryingPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl OperationPolicy for RetryingPolicy {
    fn process(
        &self,
        event: Event,
        execution: OperationExecutionFunction,
        _parameters: ParametersProcessor,
        location: &ComponentLocation,
        callback: EventCallback,
    ) {
        attempt(execution, event, self.max_retries, location.clone(), callback);
    }
}

fn attempt(
    execution: OperationExecutionFunction,
    event: Event,
    remaining: u32,
    location: ComponentLocation,
    callback: EventCallback,
) {
    let retry_execution = execution.clone();
    let retry_event = event.clone();
    let attempt_callback: EventCallback = Callback::new(move |outcome| match outcome {
        Err(error) if remaining > 0 => {
            debug!(location = %location, remaining, error = %error, "retrying operation");
            attempt(retry_execution, retry_event, remaining - 1, location, callback);
        }
        outcome => {
            callback.deliver(outcome);
        }
    });
    execution(event, attempt_callback);
}
