//! Parameter resolution.
//!
//! Each component parameter has a [`ValueResolver`]. A [`ResolverSet`]
//! resolves all of them against an event into a [`ResolverSetResult`], and
//! the [`ParameterResolver`] wraps that into a ready-to-run
//! [`ExecutionContext`].
//!
//! # Precalculated contexts
//!
//! An interception point upstream of the component may already have resolved
//! its parameters (to show them to an interceptor). It attaches the context
//! to the event keyed by the component's location; the resolver reuses that
//! exact context instead of resolving again, so resolvers with side effects
//! run at most once per event.
//!
//! ```text
//! event ─► interception for my location? ──yes──► reuse Arc<ExecutionContext>
//!                     │
//!                     no
//!                     ▼
//!          configuration + ResolverSet::resolve ─► new ExecutionContext
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::chain::MessageProcessorChain;
use crate::component::{ComponentLocation, ComponentModel};
use crate::configuration::{ConfigurationInstance, ConfigurationProvider};
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::event::{Event, InterceptionPoint, TypedValue};

/// Parameter name used when resolving the configuration fails.
pub const CONFIG_PARAMETER: &str = "config-ref";

// =============================================================================
// Resolved values
// =============================================================================

/// A resolved parameter.
#[derive(Clone)]
pub enum ParameterValue {
    Value(TypedValue),
    /// A nested chain the component may run (routers and scopes).
    Chain(Arc<MessageProcessorChain>),
}

impl ParameterValue {
    pub fn as_value(&self) -> Option<&TypedValue> {
        match self {
            ParameterValue::Value(value) => Some(value),
            ParameterValue::Chain(_) => None,
        }
    }

    pub fn as_chain(&self) -> Option<&Arc<MessageProcessorChain>> {
        match self {
            ParameterValue::Chain(chain) => Some(chain),
            ParameterValue::Value(_) => None,
        }
    }
}

impl fmt::Debug for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            ParameterValue::Chain(chain) => write!(f, "Chain({})", chain.name()),
        }
    }
}

impl From<TypedValue> for ParameterValue {
    fn from(value: TypedValue) -> Self {
        ParameterValue::Value(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Value(value.into())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Value(value.into())
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(value: serde_json::Value) -> Self {
        ParameterValue::Value(value.into())
    }
}

impl From<Arc<MessageProcessorChain>> for ParameterValue {
    fn from(chain: Arc<MessageProcessorChain>) -> Self {
        ParameterValue::Chain(chain)
    }
}

/// Resolved parameters of one invocation, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct ResolverSetResult {
    values: BTreeMap<String, ParameterValue>,
}

impl ResolverSetResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// The parameter as a plain value.
    pub fn value(&self, name: &str) -> Option<&TypedValue> {
        self.get(name).and_then(ParameterValue::as_value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// =============================================================================
// Value resolvers
// =============================================================================

/// What a resolver resolves against.
pub struct ValueResolvingContext<'a> {
    pub event: &'a Event,
    pub configuration: Option<&'a Arc<ConfigurationInstance>>,
}

/// Resolves one parameter against an event.
#[async_trait]
pub trait ValueResolver: Send + Sync + 'static {
    async fn resolve(&self, ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue>;

    /// False if the resolver ignores the event.
    fn is_dynamic(&self) -> bool {
        true
    }
}

/// Always resolves to the same value.
pub struct StaticValueResolver(pub TypedValue);

#[async_trait]
impl ValueResolver for StaticValueResolver {
    async fn resolve(&self, _ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue> {
        Ok(ParameterValue::Value(self.0.clone()))
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

/// Resolves to the event's payload.
pub struct PayloadResolver;

#[async_trait]
impl ValueResolver for PayloadResolver {
    async fn resolve(&self, ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue> {
        Ok(ParameterValue::Value(ctx.event.message().payload().clone()))
    }
}

/// Resolves to a variable of the event.
pub struct VariableResolver {
    name: String,
    required: bool,
}

impl VariableResolver {
    /// Fails resolution if the variable is missing.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    /// Resolves a missing variable to `Null`.
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

#[async_trait]
impl ValueResolver for VariableResolver {
    async fn resolve(&self, ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue> {
        match ctx.event.variable(&self.name) {
            Some(value) => Ok(ParameterValue::Value(value.clone())),
            None if self.required => anyhow::bail!("variable '{}' is not defined", self.name),
            None => Ok(ParameterValue::Value(TypedValue::Null)),
        }
    }
}

/// Resolves to a nested chain.
pub struct ChainResolver(pub Arc<MessageProcessorChain>);

#[async_trait]
impl ValueResolver for ChainResolver {
    async fn resolve(&self, _ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue> {
        Ok(ParameterValue::Chain(self.0.clone()))
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

/// Resolves through a closure over the event.
pub struct FnResolver<F> {
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&Event) -> anyhow::Result<TypedValue> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ValueResolver for FnResolver<F>
where
    F: Fn(&Event) -> anyhow::Result<TypedValue> + Send + Sync + 'static,
{
    async fn resolve(&self, ctx: &ValueResolvingContext<'_>) -> anyhow::Result<ParameterValue> {
        (self.f)(ctx.event).map(ParameterValue::Value)
    }
}

/// The resolvers of all parameters of a component, in declaration order.
#[derive(Default, Clone)]
pub struct ResolverSet {
    resolvers: Vec<(String, Arc<dyn ValueResolver>)>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, resolver: impl ValueResolver) -> Self {
        self.resolvers.push((name.into(), Arc::new(resolver)));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// True if any resolver depends on the event.
    pub fn is_dynamic(&self) -> bool {
        self.resolvers.iter().any(|(_, r)| r.is_dynamic())
    }

    /// Resolve every parameter. The first failure aborts resolution.
    pub async fn resolve(
        &self,
        component: &str,
        ctx: &ValueResolvingContext<'_>,
    ) -> Result<ResolverSetResult, EngineError> {
        let mut result = ResolverSetResult::new();
        for (name, resolver) in &self.resolvers {
            let value = resolver
                .resolve(ctx)
                .await
                .map_err(|source| EngineError::Resolution {
                    component: component.to_string(),
                    parameter: name.clone(),
                    source,
                })?;
            result.insert(name.clone(), value);
        }
        Ok(result)
    }
}

impl fmt::Debug for ResolverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.resolvers.iter().map(|(name, _)| name))
            .finish()
    }
}

// =============================================================================
// Parameter resolver
// =============================================================================

/// The outcome of resolving an invocation.
#[derive(Debug, Clone)]
pub struct ResolvedInvocation {
    pub context: Arc<ExecutionContext>,
    /// True if the context was precalculated upstream and reused.
    pub precalculated: bool,
}

impl ResolvedInvocation {
    pub fn parameters(&self) -> &ResolverSetResult {
        self.context.parameters()
    }

    pub fn configuration(&self) -> Option<&Arc<ConfigurationInstance>> {
        self.context.configuration()
    }
}

/// Resolves a component's configuration and parameters into an
/// [`ExecutionContext`].
pub struct ParameterResolver {
    component: ComponentModel,
    location: Option<ComponentLocation>,
    resolvers: ResolverSet,
    configuration: Option<Arc<dyn ConfigurationProvider>>,
    resolutions: AtomicU64,
}

impl ParameterResolver {
    pub fn new(
        component: ComponentModel,
        location: Option<ComponentLocation>,
        resolvers: ResolverSet,
        configuration: Option<Arc<dyn ConfigurationProvider>>,
    ) -> Self {
        Self {
            component,
            location,
            resolvers,
            configuration,
            resolutions: AtomicU64::new(0),
        }
    }

    /// Number of times parameters were actually resolved (not reused).
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::Acquire)
    }

    pub fn configuration_provider(&self) -> Option<&Arc<dyn ConfigurationProvider>> {
        self.configuration.as_ref()
    }

    /// Resolve against `event`, reusing a context precalculated for this
    /// component's location if the event carries one.
    pub async fn resolve(&self, event: &Event) -> Result<ResolvedInvocation, EngineError> {
        if let Some(context) = self.precalculated(event) {
            trace!(component = %self.component.name(), "reusing precalculated execution context");
            context.change_event(event.clone().without_interception());
            return Ok(ResolvedInvocation {
                context,
                precalculated: true,
            });
        }

        let event = event.clone().without_interception();
        let configuration = match &self.configuration {
            Some(provider) => {
                Some(
                    provider
                        .get(&event)
                        .map_err(|source| EngineError::Resolution {
                            component: self.component.name().to_string(),
                            parameter: CONFIG_PARAMETER.to_string(),
                            source,
                        })?,
                )
            }
            None => None,
        };

        let parameters = {
            let ctx = ValueResolvingContext {
                event: &event,
                configuration: configuration.as_ref(),
            };
            self.resolvers.resolve(self.component.name(), &ctx).await?
        };
        self.resolutions.fetch_add(1, Ordering::AcqRel);

        let context = ExecutionContext::new(
            self.component.clone(),
            self.location.clone(),
            configuration,
            parameters,
            event,
        );
        Ok(ResolvedInvocation {
            context: Arc::new(context),
            precalculated: false,
        })
    }

    /// Resolve now and attach the context to the event, keyed by this
    /// component's location, so a later [`resolve`](Self::resolve) reuses it.
    ///
    /// Components without a location have nothing to key on; the event is
    /// returned unchanged.
    pub async fn resolve_for_interception(&self, event: Event) -> Result<Event, EngineError> {
        let Some(location) = &self.location else {
            return Ok(event);
        };
        let resolved = self.resolve(&event).await?;
        let point = InterceptionPoint {
            location: location.to_string(),
            context: resolved.context,
        };
        Ok(event.with_interception(Arc::new(point)))
    }

    fn precalculated(&self, event: &Event) -> Option<Arc<ExecutionContext>> {
        let point = event.interception()?;
        let location = self.location.as_ref()?;
        if point.location == location.to_string() {
            Some(point.context.clone())
        } else {
            None
        }
    }
}

impl fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterResolver")
            .field("component", &self.component.name())
            .field("location", &self.location)
            .field("resolvers", &self.resolvers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{ConfigurationInstance, StaticConfigurationProvider};
    use crate::error::FailureKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn model() -> ComponentModel {
        ComponentModel::new("test:op", "test")
    }

    fn location() -> ComponentLocation {
        ComponentLocation::new("flow", "processors/0")
    }

    #[tokio::test]
    async fn test_resolves_parameters_in_order() {
        let resolver = ParameterResolver::new(
            model(),
            None,
            ResolverSet::new()
                .add("static", StaticValueResolver(TypedValue::from("fixed")))
                .add("payload", PayloadResolver)
                .add("var", VariableResolver::optional("missing")),
            None,
        );

        let resolved = resolver.resolve(&Event::of("body")).await.unwrap();
        let params = resolved.parameters();
        assert_eq!(params.value("static").and_then(TypedValue::as_str), Some("fixed"));
        assert_eq!(params.value("payload").and_then(TypedValue::as_str), Some("body"));
        assert!(params.value("var").unwrap().is_null());
        assert!(!resolved.precalculated);
        assert_eq!(resolver.resolution_count(), 1);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_typed() {
        let resolver = ParameterResolver::new(
            model(),
            None,
            ResolverSet::new().add("id", VariableResolver::required("id")),
            None,
        );

        let err = resolver.resolve(&Event::of("body")).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Resolution);
        match err {
            EngineError::Resolution { parameter, .. } => assert_eq!(parameter, "id"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_configuration_is_resolved_first() {
        let provider: Arc<dyn ConfigurationProvider> = Arc::new(StaticConfigurationProvider::new(
            ConfigurationInstance::new("db-config", json!({"pool": 4})),
        ));
        let resolver = ParameterResolver::new(
            model().with_requires_config(true),
            None,
            ResolverSet::new(),
            Some(provider),
        );

        let resolved = resolver.resolve(&Event::of("x")).await.unwrap();
        assert_eq!(resolved.configuration().unwrap().name(), "db-config");
    }

    #[tokio::test]
    async fn test_precalculated_context_reused_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resolver = ParameterResolver::new(
            model(),
            Some(location()),
            ResolverSet::new().add(
                "side_effect",
                FnResolver::new(move |_| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(TypedValue::from("resolved"))
                }),
            ),
            None,
        );

        let intercepted = resolver
            .resolve_for_interception(Event::of("first"))
            .await
            .unwrap();
        let precalculated = intercepted.interception().unwrap().context.clone();

        let later = intercepted.with_payload("changed");
        let resolved = resolver.resolve(&later).await.unwrap();

        assert!(resolved.precalculated);
        assert!(Arc::ptr_eq(&resolved.context, &precalculated));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            resolved.context.event().message().payload().as_str(),
            Some("changed")
        );
        assert!(resolved.context.event().interception().is_none());
    }

    #[tokio::test]
    async fn test_precalculated_context_for_other_location_is_ignored() {
        let upstream = ParameterResolver::new(
            model(),
            Some(ComponentLocation::new("flow", "processors/5")),
            ResolverSet::new(),
            None,
        );
        let resolver = ParameterResolver::new(model(), Some(location()), ResolverSet::new(), None);

        let event = upstream
            .resolve_for_interception(Event::of("x"))
            .await
            .unwrap();
        let resolved = resolver.resolve(&event).await.unwrap();
        assert!(!resolved.precalculated);
    }
}
