//! The bundle handed to an executor for one invocation.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::chain::{ChildContextChainExecutor, ProcessorChainExecutor};
use crate::component::{ComponentLocation, ComponentModel};
use crate::configuration::ConfigurationInstance;
use crate::connection::ConnectionHandle;
use crate::event::{Event, TypedValue};
use crate::resolver::{ParameterValue, ResolverSetResult};

/// Event, component, configuration and resolved parameters of one
/// invocation.
///
/// Shared as `Arc<ExecutionContext>`. A context precalculated by an
/// interception point is reused by identity, with its event swapped for the
/// current one through [`change_event`](Self::change_event). The connection
/// slot is filled by the connection interceptor right before the executor
/// runs.
pub struct ExecutionContext {
    component: ComponentModel,
    location: Option<ComponentLocation>,
    configuration: Option<Arc<ConfigurationInstance>>,
    parameters: ResolverSetResult,
    event: RwLock<Event>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl ExecutionContext {
    pub fn new(
        component: ComponentModel,
        location: Option<ComponentLocation>,
        configuration: Option<Arc<ConfigurationInstance>>,
        parameters: ResolverSetResult,
        event: Event,
    ) -> Self {
        Self {
            component,
            location,
            configuration,
            parameters,
            event: RwLock::new(event),
            connection: Mutex::new(None),
        }
    }

    /// A context for an anonymous component with no parameters.
    pub fn for_event(event: Event) -> Self {
        Self::new(
            ComponentModel::new("anonymous", "default"),
            None,
            None,
            ResolverSetResult::new(),
            event,
        )
    }

    pub fn component(&self) -> &ComponentModel {
        &self.component
    }

    pub fn location(&self) -> Option<&ComponentLocation> {
        self.location.as_ref()
    }

    pub fn configuration(&self) -> Option<&Arc<ConfigurationInstance>> {
        self.configuration.as_ref()
    }

    pub fn parameters(&self) -> &ResolverSetResult {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    /// A plain-value parameter.
    pub fn value(&self, name: &str) -> Option<&TypedValue> {
        self.parameters.value(name)
    }

    /// The event being processed.
    pub fn event(&self) -> Event {
        match self.event.read() {
            Ok(event) => event.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the event (used when a precalculated context is reused).
    pub fn change_event(&self, event: Event) {
        let mut guard = match self.event.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = event;
    }

    /// The injected connection, if it is a `T`.
    pub fn connection<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lock_connection().as_ref()?.downcast::<T>()
    }

    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.lock_connection().clone()
    }

    pub(crate) fn set_connection(&self, connection: ConnectionHandle) {
        *self.lock_connection() = Some(connection);
    }

    pub(crate) fn take_connection(&self) -> Option<ConnectionHandle> {
        self.lock_connection().take()
    }

    /// Run the chain parameter `name` against the current event, in the same
    /// event context.
    pub fn chain_executor(&self, name: &str) -> Option<ProcessorChainExecutor> {
        let chain = self.parameter(name)?.as_chain()?.clone();
        Some(ProcessorChainExecutor::new(chain, self.event()))
    }

    /// Run the chain parameter `name` against the current event, in a child
    /// event context.
    pub fn child_chain_executor(&self, name: &str) -> Option<ChildContextChainExecutor> {
        let chain = self.parameter(name)?.as_chain()?.clone();
        Some(ChildContextChainExecutor::new(chain, self.event()))
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("component", &self.component.name())
            .field("location", &self.location)
            .field(
                "configuration",
                &self.configuration.as_ref().map(|c| c.name().to_string()),
            )
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}
