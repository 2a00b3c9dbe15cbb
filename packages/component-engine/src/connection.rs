//! Connections injected into an execution context before invocation.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// A failure obtaining or using a connection.
///
/// Executors report this (through `callback.error`) when the connection they
/// were handed turned out to be broken; the mediator then invalidates the
/// connection and, if the configuration has a retry policy, tries again.
#[derive(Debug, Error)]
#[error("connection error: {message}")]
pub struct ConnectionError {
    message: String,
    #[source]
    source: Option<anyhow::Error>,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }

    /// True if `error` is, or wraps, a connection error.
    pub fn is_connection_error(error: &anyhow::Error) -> bool {
        error.chain().any(|cause| cause.is::<ConnectionError>())
    }
}

/// An opaque connection handed to an executor.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    value: Arc<dyn Any + Send + Sync>,
}

impl ConnectionHandle {
    pub fn new<T: Any + Send + Sync>(id: u64, value: T) -> Self {
        Self {
            id,
            value: Arc::new(value),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection, if it is a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Source of connections for a configuration.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connect(&self) -> Result<ConnectionHandle, ConnectionError>;

    /// Return a healthy connection after use.
    fn release(&self, _connection: ConnectionHandle) {}

    /// Discard a connection that failed.
    fn invalidate(&self, _connection: ConnectionHandle) {}
}

/// Connection provider backed by a factory closure, with usage counters.
pub struct FnConnectionProvider<F> {
    factory: F,
    next_id: AtomicU64,
    active: AtomicUsize,
    invalidated: AtomicUsize,
}

impl<F, T> FnConnectionProvider<F>
where
    F: Fn() -> Result<T, ConnectionError> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            invalidated: AtomicUsize::new(0),
        }
    }

    /// Connections handed out and not yet released or invalidated.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn invalidated(&self) -> usize {
        self.invalidated.load(Ordering::Acquire)
    }
}

impl<F, T> ConnectionProvider for FnConnectionProvider<F>
where
    F: Fn() -> Result<T, ConnectionError> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn connect(&self) -> Result<ConnectionHandle, ConnectionError> {
        let value = (self.factory)()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(ConnectionHandle::new(id, value))
    }

    fn release(&self, _connection: ConnectionHandle) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn invalidate(&self, _connection: ConnectionHandle) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.invalidated.fetch_add(1, Ordering::AcqRel);
    }
}
