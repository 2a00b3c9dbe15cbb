//! Events, messages and event contexts.
//!
//! An [`Event`] is the unit that flows through a component. It is logically
//! immutable per hop: every stage derives a new `Event` value from its input
//! using the `with_*` builders, sharing the same [`EventContext`].
//!
//! # Event Contexts
//!
//! The context tracks completion of one event's lifetime. It owns the
//! correlation id and root id, supports completion listeners, and may be a
//! *child* of another context:
//!
//! ```text
//! parent ──┬── child A (open)      parent.success() is deferred
//!          └── child B (done)      until child A completes
//! ```
//!
//! - completing a child never completes its parent
//! - a parent with open children defers its own completion (and listeners)
//!   until the last child completes

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use tracing::warn;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::streaming::CursorStreamProvider;

// =============================================================================
// Correlation ID
// =============================================================================

/// Correlation id shared by every event derived from the same request.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh, random correlation id.
    pub fn new() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

// =============================================================================
// Typed Values & Messages
// =============================================================================

/// A value carried by a message, a variable or a component result.
#[derive(Clone, Default)]
pub enum TypedValue {
    /// No value.
    #[default]
    Null,
    /// A structured value.
    Json(serde_json::Value),
    /// An open streamable resource. Must be managed by a
    /// [`StreamingManager`](crate::StreamingManager) once it enters an event.
    Stream(Arc<dyn CursorStreamProvider>),
    /// A whole message (used when a result is stored in a target variable).
    Message(Box<Message>),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// The value as a string slice, if it is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Json(value) => value.as_str(),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            TypedValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            TypedValue::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&Arc<dyn CursorStreamProvider>> {
        match self {
            TypedValue::Stream(provider) => Some(provider),
            _ => None,
        }
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Null => write!(f, "Null"),
            TypedValue::Json(value) => write!(f, "Json({value})"),
            TypedValue::Stream(provider) => write!(f, "Stream(#{})", provider.id()),
            TypedValue::Message(message) => f.debug_tuple("Message").field(message).finish(),
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypedValue::Null, TypedValue::Null) => true,
            (TypedValue::Json(a), TypedValue::Json(b)) => a == b,
            (TypedValue::Stream(a), TypedValue::Stream(b)) => a.id() == b.id(),
            (TypedValue::Message(a), TypedValue::Message(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::Json(serde_json::Value::String(value))
    }
}

impl From<serde_json::Value> for TypedValue {
    fn from(value: serde_json::Value) -> Self {
        TypedValue::Json(value)
    }
}

impl From<Message> for TypedValue {
    fn from(value: Message) -> Self {
        TypedValue::Message(Box::new(value))
    }
}

impl From<Arc<dyn CursorStreamProvider>> for TypedValue {
    fn from(value: Arc<dyn CursorStreamProvider>) -> Self {
        TypedValue::Stream(value)
    }
}

/// Payload plus attributes envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    payload: TypedValue,
    attributes: TypedValue,
}

impl Message {
    pub fn new(payload: impl Into<TypedValue>, attributes: impl Into<TypedValue>) -> Self {
        Self {
            payload: payload.into(),
            attributes: attributes.into(),
        }
    }

    /// A message with the given payload and no attributes.
    pub fn of(payload: impl Into<TypedValue>) -> Self {
        Self {
            payload: payload.into(),
            attributes: TypedValue::Null,
        }
    }

    pub fn payload(&self) -> &TypedValue {
        &self.payload
    }

    pub fn attributes(&self) -> &TypedValue {
        &self.attributes
    }

    pub fn with_payload(mut self, payload: impl Into<TypedValue>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_attributes(mut self, attributes: impl Into<TypedValue>) -> Self {
        self.attributes = attributes.into();
        self
    }
}

// =============================================================================
// Event Context
// =============================================================================

/// How an event context completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success,
    Error(String),
}

impl CompletionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }
}

type CompletionListener = Box<dyn FnOnce(&CompletionOutcome) + Send>;

struct ContextState {
    /// Set once the context has actually completed.
    completed: Option<CompletionOutcome>,
    /// Completion requested while children were still open.
    pending: Option<CompletionOutcome>,
    open_children: usize,
    listeners: SmallVec<[CompletionListener; 2]>,
}

struct ContextInner {
    id: String,
    correlation_id: CorrelationId,
    root_id: String,
    parent: Option<EventContext>,
    created_at: DateTime<Utc>,
    state: Mutex<ContextState>,
}

/// Tracks completion, correlation and ancestry for one event's lifetime.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<ContextInner>,
}

impl EventContext {
    /// A new root context with a generated correlation id.
    pub fn new() -> Self {
        Self::with_correlation(CorrelationId::new())
    }

    /// A new root context with the given correlation id.
    pub fn with_correlation(correlation_id: impl Into<CorrelationId>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self::build(id.clone(), correlation_id.into(), id, None)
    }

    /// Create a child context.
    ///
    /// The child shares this context's root id and, unless overridden, its
    /// correlation id. This context stays open until the child completes.
    pub fn child(&self, correlation_id: Option<CorrelationId>) -> EventContext {
        self.lock_state().open_children += 1;
        Self::build(
            Uuid::new_v4().to_string(),
            correlation_id.unwrap_or_else(|| self.inner.correlation_id.clone()),
            self.inner.root_id.clone(),
            Some(self.clone()),
        )
    }

    fn build(
        id: String,
        correlation_id: CorrelationId,
        root_id: String,
        parent: Option<EventContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                correlation_id,
                root_id,
                parent,
                created_at: Utc::now(),
                state: Mutex::new(ContextState {
                    completed: None,
                    pending: None,
                    open_children: 0,
                    listeners: SmallVec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.inner.correlation_id
    }

    pub fn root_id(&self) -> &str {
        &self.inner.root_id
    }

    pub fn parent(&self) -> Option<&EventContext> {
        self.inner.parent.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// True once this context has completed (not merely been asked to).
    pub fn is_complete(&self) -> bool {
        self.lock_state().completed.is_some()
    }

    /// The completion outcome, if completed.
    pub fn outcome(&self) -> Option<CompletionOutcome> {
        self.lock_state().completed.clone()
    }

    /// Number of child contexts that have not completed yet.
    pub fn open_children(&self) -> usize {
        self.lock_state().open_children
    }

    /// Register a completion listener. Fires immediately if already complete.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&CompletionOutcome) + Send + 'static,
    {
        let mut state = self.lock_state();
        match state.completed.clone() {
            Some(outcome) => {
                drop(state);
                listener(&outcome);
            }
            None => state.listeners.push(Box::new(listener)),
        }
    }

    /// Complete successfully.
    pub fn success(&self) {
        self.complete(CompletionOutcome::Success);
    }

    /// Complete with an error.
    pub fn error(&self, message: impl Into<String>) {
        self.complete(CompletionOutcome::Error(message.into()));
    }

    /// Request completion. The first request wins; completion is deferred
    /// while child contexts are open.
    pub fn complete(&self, outcome: CompletionOutcome) {
        let mut state = self.lock_state();
        if state.completed.is_some() || state.pending.is_some() {
            return;
        }
        if state.open_children > 0 {
            state.pending = Some(outcome);
            return;
        }
        self.finish(state, outcome);
    }

    fn child_completed(&self) {
        let mut state = self.lock_state();
        state.open_children = state.open_children.saturating_sub(1);
        let pending = if state.open_children == 0 {
            state.pending.take()
        } else {
            None
        };
        if let Some(outcome) = pending {
            self.finish(state, outcome);
        }
    }

    fn finish(&self, mut state: MutexGuard<'_, ContextState>, outcome: CompletionOutcome) {
        state.completed = Some(outcome.clone());
        let listeners = std::mem::take(&mut state.listeners);
        drop(state);

        for listener in listeners {
            listener(&outcome);
        }
        if let Some(parent) = &self.inner.parent {
            parent.child_completed();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(context = %self.inner.id, "event context mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EventContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.inner.id)
            .field("correlation_id", &self.inner.correlation_id)
            .field("root_id", &self.inner.root_id)
            .field("child", &self.inner.parent.is_some())
            .field("complete", &self.is_complete())
            .finish()
    }
}

// =============================================================================
// Interception Point
// =============================================================================

/// An execution context precalculated by an upstream interception point.
///
/// Keyed by the location of the component it was resolved for; only that
/// component reuses it.
#[derive(Debug)]
pub struct InterceptionPoint {
    pub location: String,
    pub context: Arc<ExecutionContext>,
}

// =============================================================================
// Event
// =============================================================================

/// An in-flight event.
#[derive(Clone)]
pub struct Event {
    context: EventContext,
    message: Message,
    variables: BTreeMap<String, TypedValue>,
    interception: Option<Arc<InterceptionPoint>>,
}

impl Event {
    pub fn new(context: EventContext, message: Message) -> Self {
        Self {
            context,
            message,
            variables: BTreeMap::new(),
            interception: None,
        }
    }

    /// An event with a fresh root context and the given payload.
    pub fn of(payload: impl Into<TypedValue>) -> Self {
        Self::new(EventContext::new(), Message::of(payload))
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.context.correlation_id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn variables(&self) -> &BTreeMap<String, TypedValue> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&TypedValue> {
        self.variables.get(name)
    }

    pub fn interception(&self) -> Option<&Arc<InterceptionPoint>> {
        self.interception.as_ref()
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<TypedValue>) -> Self {
        self.message = self.message.with_payload(payload);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn without_variable(mut self, name: &str) -> Self {
        self.variables.remove(name);
        self
    }

    pub fn with_interception(mut self, point: Arc<InterceptionPoint>) -> Self {
        self.interception = Some(point);
        self
    }

    pub fn without_interception(mut self) -> Self {
        self.interception = None;
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("context", &self.context)
            .field("message", &self.message)
            .field("variables", &self.variables)
            .field(
                "interception",
                &self.interception.as_ref().map(|p| p.location.as_str()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listener_fires_once_on_completion() {
        let ctx = EventContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        ctx.on_complete(move |outcome| {
            assert!(outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ctx.success();
        ctx.success();
        ctx.error("late");

        assert!(ctx.is_complete());
        assert_eq!(ctx.outcome(), Some(CompletionOutcome::Success));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_registered_after_completion_fires_immediately() {
        let ctx = EventContext::new();
        ctx.error("boom");

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        ctx.on_complete(move |outcome| {
            assert_eq!(outcome, &CompletionOutcome::Error("boom".into()));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_completion_never_completes_parent() {
        let parent = EventContext::with_correlation("parent-cid");
        let parent_fired = Arc::new(AtomicUsize::new(0));
        let counter = parent_fired.clone();
        parent.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let child = parent.child(None);
        assert_eq!(child.correlation_id().as_str(), "parent-cid");
        assert_eq!(child.root_id(), parent.root_id());
        assert_eq!(parent.open_children(), 1);

        child.error("child failed");
        assert!(child.is_complete());
        assert!(!parent.is_complete());
        assert_eq!(parent.open_children(), 0);
        assert_eq!(parent_fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parent_completion_deferred_while_children_open() {
        let parent = EventContext::new();
        let child = parent.child(Some("X".into()));
        assert_eq!(child.correlation_id().as_str(), "X");

        parent.success();
        assert!(!parent.is_complete());

        child.success();
        assert!(parent.is_complete());
        assert_eq!(parent.outcome(), Some(CompletionOutcome::Success));
    }

    #[test]
    fn test_event_builders_share_context() {
        let event = Event::of("hello").with_variable("v", "value");
        let derived = event.clone().with_payload("world");

        assert_eq!(event.message().payload().as_str(), Some("hello"));
        assert_eq!(derived.message().payload().as_str(), Some("world"));
        assert_eq!(derived.variable("v").and_then(TypedValue::as_str), Some("value"));
        assert_eq!(event.context(), derived.context());
        assert_eq!(event.correlation_id(), derived.correlation_id());
    }
}
