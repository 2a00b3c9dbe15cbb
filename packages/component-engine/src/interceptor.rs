//! Interceptors around executor invocation.
//!
//! The mediator runs every invocation through an [`InterceptorChain`]:
//!
//! ```text
//! before(1) → before(2) → … → executor
//!                                │
//!            ┌───────────────────┴───────────────────┐
//!         success                                  error
//!  on_success(each) → after(each, Some)   on_error(each) → after(each, None)
//! ```
//!
//! If a `before` fails, the executor is never called; interceptors whose
//! `before` already succeeded get `after(None)` and the error is delivered.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::ConnectionError;
use crate::context::ExecutionContext;
use crate::executor::ComponentOutput;

/// Hooks run around each invocation.
pub trait Interceptor: Send + Sync + 'static {
    /// Runs before the executor. An error aborts the invocation.
    fn before(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_success(&self, _ctx: &ExecutionContext, _output: &ComponentOutput) {}

    /// Runs when the invocation failed. May decorate or replace the error.
    fn on_error(&self, _ctx: &ExecutionContext, error: anyhow::Error) -> anyhow::Error {
        error
    }

    /// Always runs last, with the output on success.
    fn after(&self, _ctx: &ExecutionContext, _output: Option<&ComponentOutput>) {}
}

/// Interceptors in registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run every `before`. On failure, unwinds the ones that succeeded.
    pub fn before(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(error) = interceptor.before(ctx) {
                debug!(
                    component = %ctx.component().name(),
                    interceptor = index,
                    error = %error,
                    "interceptor rejected invocation"
                );
                for done in &self.interceptors[..index] {
                    done.after(ctx, None);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    pub fn on_success(&self, ctx: &ExecutionContext, output: &ComponentOutput) {
        for interceptor in &self.interceptors {
            interceptor.on_success(ctx, output);
        }
        for interceptor in &self.interceptors {
            interceptor.after(ctx, Some(output));
        }
    }

    pub fn on_error(&self, ctx: &ExecutionContext, error: anyhow::Error) -> anyhow::Error {
        let error = self
            .interceptors
            .iter()
            .fold(error, |error, interceptor| interceptor.on_error(ctx, error));
        for interceptor in &self.interceptors {
            interceptor.after(ctx, None);
        }
        error
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Obtains a connection from the configuration before invocation and hands
/// it back afterwards.
///
/// Broken connections (the invocation failed with a [`ConnectionError`]) are
/// invalidated instead of released.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionInterceptor;

impl Interceptor for ConnectionInterceptor {
    fn before(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let Some(provider) = ctx.configuration().and_then(|c| c.connection_provider()) else {
            return Ok(());
        };
        let connection = provider.connect()?;
        ctx.set_connection(connection);
        Ok(())
    }

    fn on_error(&self, ctx: &ExecutionContext, error: anyhow::Error) -> anyhow::Error {
        if ConnectionError::is_connection_error(&error) {
            let provider = ctx.configuration().and_then(|c| c.connection_provider());
            if let (Some(provider), Some(connection)) = (provider, ctx.take_connection()) {
                warn!(
                    component = %ctx.component().name(),
                    connection = connection.id(),
                    "invalidating connection after connection error"
                );
                provider.invalidate(connection);
            }
        }
        error
    }

    fn after(&self, ctx: &ExecutionContext, _output: Option<&ComponentOutput>) {
        let provider = ctx.configuration().and_then(|c| c.connection_provider());
        if let (Some(provider), Some(connection)) = (provider, ctx.take_connection()) {
            provider.release(connection);
        }
    }
}
