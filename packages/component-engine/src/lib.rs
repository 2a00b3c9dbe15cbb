//! # Component Engine
//!
//! An asynchronous execution engine for pluggable components. Events flow
//! in, each one is resolved into parameters, run through an operation
//! policy and executed by a component; exactly one outcome flows back out.
//!
//! ## Core Concepts
//!
//! - [`Event`] = the unit of work (message + variables + context)
//! - [`ComponentExecutor`] = the component itself; signals its outcome on a
//!   single-use [`Callback`]
//! - [`ExecutionMediator`] = lifecycle, interceptors and retries around one
//!   executor
//! - [`ComponentMessageProcessor`] = parameter resolution, policies, return
//!   delegates and stream topology around one mediator
//!
//! The key principle: **One Event = One Outcome**. Every event submitted is
//! answered exactly once, with either a result event or a
//! [`MessagingError`] carrying the failing event.
//!
//! ## Architecture
//!
//! ```text
//! upstream events
//!     │
//!     ▼ apply()
//! outer subscription (bounded by max_inflight)
//!     │
//!     ├─► inline ───────────────────────────┐
//!     │                                     │
//!     └─► inner pipeline 0..N (round-robin) ┤
//!                                           ▼
//!                               ParameterResolver.resolve()
//!                                           │
//!                                           ▼
//!                                 OperationPolicy.process()
//!                                           │
//!                                           ▼
//!                    ExecutionMediator ─► interceptors ─► executor
//!                                           │
//!                                           ▼ callback (exactly once)
//!                                    ReturnDelegate
//!                                           │
//!                                           ▼
//!                                  Result<Event, MessagingError>
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Exactly-once completion** - Duplicate signals are logged and dropped,
//!    dropped callbacks report an error
//! 2. **Context isolation** - Concurrent invocations never observe each
//!    other's event context
//! 3. **Stopped means stopped** - A stopped mediator rejects new work and
//!    drains or abandons what is in flight per [`ShutdownMode`]
//! 4. **Per-subscription independence** - Each outer subscription sees only
//!    its own results and completes once its own events are answered
//!
//! ## Example
//!
//! ```ignore
//! use component_engine::{
//!     ComponentLocation, ComponentMessageProcessor, ComponentModel, ComponentOutput,
//!     Event, FnExecutor, TypedValue,
//! };
//! use std::sync::Arc;
//!
//! let executor = Arc::new(FnExecutor::new(|ctx| {
//!     let text = ctx.event().message().payload().as_str().unwrap_or_default();
//!     Ok(ComponentOutput::value(text.to_uppercase()))
//! }));
//!
//! let processor = ComponentMessageProcessor::builder(
//!     ComponentModel::new("demo:upper", "demo"),
//!     executor,
//! )
//! .with_location(ComponentLocation::new("flow", "processors/0"))
//! .build()?;
//!
//! let result = processor.process(Event::of(TypedValue::from("hello"))).await?;
//! assert_eq!(result.message().payload().as_str(), Some("HELLO"));
//! ```

// Core modules
mod component;
mod config;
mod context;
mod error;
mod event;
mod executor;
mod inflight;
mod lifecycle;
mod mediator;
mod processor;
mod scheduler;
mod telemetry;

// Extension points and thread-scoped state
pub mod chain;
pub mod configuration;
pub mod connection;
pub mod deferred;
pub mod exec_scope;
pub mod interceptor;
pub mod mdc;
pub mod policy;
pub mod resolver;
pub mod return_delegate;
pub mod streaming;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export event types
pub use crate::event::{
    CompletionOutcome, CorrelationId, Event, EventContext, InterceptionPoint, Message, TypedValue,
};

// Re-export error types
pub use crate::error::{EngineError, FailureKind, MessagingError};

// Re-export component metadata
pub use crate::component::{ComponentLocation, ComponentModel};

// Re-export executor types
pub use crate::context::ExecutionContext;
pub use crate::executor::{
    AsyncExecutor, AsyncFnExecutor, AsyncOperation, Callback, ComponentExecutor,
    ComponentOutput, EventCallback, ExecutorCallback, FnExecutor, OutputResult,
};

// Re-export lifecycle and scheduling types
pub use crate::inflight::{InflightCounter, InflightGuard};
pub use crate::lifecycle::LifecycleState;
pub use crate::scheduler::{ProcessingType, Schedulers};

// Re-export mediator types
pub use crate::mediator::{
    ExecutionMediator, ExecutionMediatorBuilder, ShutdownMode, DEFAULT_TERMINATION_TIMEOUT,
};

// Re-export processor types (primary entry point)
pub use crate::processor::{
    ComponentMessageProcessor, ComponentMessageProcessorBuilder, ProcessedStream,
};

// Re-export commonly used extension types
pub use chain::{EventProcessor, MessageProcessorChain};
pub use policy::{OperationPolicy, PolicyManager};
pub use resolver::{ParameterResolver, ParameterValue, ValueResolver};

// Re-export configuration and telemetry
pub use crate::config::{EngineConfig, DEFAULT_OUTER_TERMINATION_TIMEOUT};
pub use crate::telemetry::init_tracing;

// Re-export commonly used external types
pub use async_trait::async_trait;
