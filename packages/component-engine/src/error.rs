//! Structured error types for the component engine.
//!
//! `EngineError` provides pattern-matchable errors for the engine's own
//! failure modes. `MessagingError` is the boundary type: it is the only
//! error that leaves a [`ComponentMessageProcessor`](crate::ComponentMessageProcessor)
//! stream, and it always carries the event that was in flight when the
//! failure happened.
//!
//! # The Error Boundary Rule
//!
//! > **No bare `anyhow::Error` is ever emitted downstream.**
//!
//! - `anyhow` is internal transport (ergonomic for executors, resolvers,
//!   interceptors and policies)
//! - `MessagingError` is the only externalized error, structured so that
//!   downstream error handling can inspect message state at failure time
//!
//! # Taxonomy
//!
//! | Kind | Raised by | Executor called? | Surfaced as |
//! |------|-----------|------------------|-------------|
//! | Resolution | parameter resolvers | never | stream item |
//! | Invocation | executor / policy / interceptor | yes | stream item |
//! | Lifecycle | `initialise` / `start` of the executor | no further calls | `Err` from setup, stream item for late events |
//! | Validation | `build()` | never | `Err` from setup |
//!
//! # Example
//!
//! ```ignore
//! while let Some(item) = stream.next().await {
//!     match item {
//!         Ok(event) => forward(event),
//!         Err(failure) => match failure.kind() {
//!             FailureKind::Resolution => reject(failure.event()),
//!             FailureKind::Invocation => retry_later(failure.event()),
//!             _ => escalate(failure),
//!         },
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::event::Event;
use crate::lifecycle::LifecycleState;

// =============================================================================
// Engine Error
// =============================================================================

/// Errors produced by the engine itself.
///
/// Executors and policies report their own failures as `anyhow::Error`; the
/// engine wraps those into [`MessagingError`] at the stream boundary. These
/// variants cover what the engine detects on its own.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A parameter resolver failed. The executor was never invoked.
    #[error("failed to resolve parameter '{parameter}' of '{component}'")]
    Resolution {
        /// Component whose parameters were being resolved.
        component: String,
        /// The parameter that failed.
        parameter: String,
        /// The resolver's error.
        #[source]
        source: anyhow::Error,
    },

    /// The executor failed to initialise or start. Fatal to the instance.
    #[error("lifecycle phase '{phase}' failed for '{component}'")]
    Lifecycle {
        /// Component whose executor failed.
        component: String,
        /// The phase that failed (`initialise`, `start`, `stop`).
        phase: &'static str,
        /// The executor's error.
        #[source]
        source: anyhow::Error,
    },

    /// Misconfiguration detected while building a component.
    #[error("invalid configuration for '{component}': {message}")]
    Validation {
        /// Component being built.
        component: String,
        /// What is wrong.
        message: String,
    },

    /// The component is not in a state that accepts new invocations.
    #[error("component '{component}' is {state} and does not accept new invocations")]
    NotRunning {
        /// Component that rejected the invocation.
        component: String,
        /// Its current lifecycle state.
        state: LifecycleState,
    },

    /// A lifecycle transition that the state machine does not allow.
    #[error("illegal lifecycle transition for '{component}': {from} -> {to}")]
    IllegalTransition {
        /// Component whose state was being changed.
        component: String,
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// An operation did not finish within its deadline.
    #[error("timed out after {duration:?}")]
    Timeout {
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// The executor panicked while being invoked.
    #[error("component executor panicked: {message}")]
    ExecutorPanicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A callback was dropped without ever being signalled.
    #[error("callback dropped without a completion signal")]
    CallbackDropped,

    /// The invocation was abandoned because its subscription or component
    /// terminated first.
    #[error("invocation abandoned: {reason}")]
    Abandoned {
        /// Why it was abandoned.
        reason: &'static str,
    },

    /// No tokio runtime was available where one was required.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl EngineError {
    /// Returns true if this error prevents any further invocation of the
    /// component (lifecycle failures and stopped/disposed components).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Lifecycle { .. }
                | EngineError::NotRunning { .. }
                | EngineError::IllegalTransition { .. }
        )
    }

    /// The failure kind this error maps to at the stream boundary.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Resolution { .. } => FailureKind::Resolution,
            EngineError::Lifecycle { .. }
            | EngineError::NotRunning { .. }
            | EngineError::IllegalTransition { .. }
            | EngineError::Validation { .. } => FailureKind::Lifecycle,
            EngineError::Abandoned { .. } | EngineError::CallbackDropped => {
                FailureKind::Abandoned
            }
            EngineError::Timeout { .. }
            | EngineError::ExecutorPanicked { .. }
            | EngineError::NoRuntime(_) => FailureKind::Invocation,
        }
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Messaging Error (the boundary type)
// =============================================================================

/// Classification of a failure delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Parameter resolution failed before the executor ran.
    Resolution,
    /// The executor, an interceptor or a policy reported an error.
    Invocation,
    /// The component could not run (failed start, stopped, disposed).
    Lifecycle,
    /// The invocation was dropped or abandoned without a result.
    Abandoned,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Resolution => write!(f, "resolution"),
            FailureKind::Invocation => write!(f, "invocation"),
            FailureKind::Lifecycle => write!(f, "lifecycle"),
            FailureKind::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A failure that carries the event that was in flight when it happened.
///
/// This is the error half of every item a processor stream emits. Exactly one
/// item (either an event or a `MessagingError`) is emitted per submitted
/// event.
#[derive(Debug, Error)]
#[error("{kind} failure processing event {event_id}: {source}")]
pub struct MessagingError {
    event: Box<Event>,
    event_id: String,
    kind: FailureKind,
    #[source]
    source: anyhow::Error,
}

impl MessagingError {
    /// Wrap an error together with the in-flight event.
    ///
    /// If `error` already is a `MessagingError` (for example, raised by a
    /// nested chain), it is returned unchanged so the innermost event state
    /// is preserved. Engine errors keep their own classification; anything
    /// else is an invocation failure.
    pub fn new(event: Event, error: anyhow::Error) -> Self {
        let error = match error.downcast::<MessagingError>() {
            Ok(existing) => return existing,
            Err(other) => other,
        };
        let kind = error
            .downcast_ref::<EngineError>()
            .map(EngineError::failure_kind)
            .unwrap_or(FailureKind::Invocation);
        Self::with_kind(event, kind, error)
    }

    /// Wrap an error with an explicit kind.
    pub fn with_kind(event: Event, kind: FailureKind, error: anyhow::Error) -> Self {
        Self {
            event_id: event.context().id().to_string(),
            event: Box::new(event),
            kind,
            source: error,
        }
    }

    /// The event at the moment of failure.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Consume the error, returning the event at the moment of failure.
    pub fn into_event(self) -> Event {
        *self.event
    }

    /// How this failure is classified.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The underlying cause.
    pub fn cause(&self) -> &anyhow::Error {
        &self.source
    }

    /// Consume the error, returning the underlying cause.
    pub fn into_cause(self) -> anyhow::Error {
        self.source
    }

    /// Downcast the cause to an engine error, if it is one.
    pub fn engine_error(&self) -> Option<&EngineError> {
        self.source.downcast_ref::<EngineError>()
    }
}
