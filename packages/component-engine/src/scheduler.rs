//! Processing types and the worker pools they map onto.
//!
//! A component declares a logical processing type. The processor maps it to
//! a scheduling hint used to pick the pool its inner pipelines dispatch to:
//!
//! | Declared | Scheduling hint | Pool |
//! |----------|-----------------|------|
//! | `Blocking` | `Blocking` | `spawn_blocking` on the blocking handle |
//! | `CpuLite` | `CpuLiteAsync` | async task on the cpu-lite handle |
//! | `CpuLiteAsync` | `CpuLiteAsync` | async task on the cpu-lite handle |
//! | `CpuIntensive` | `CpuIntensive` | `spawn_blocking` on the cpu-intensive handle |

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::EngineError;

/// Logical execution type of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    /// Performs blocking I/O.
    Blocking,
    /// Short, non-blocking work.
    CpuLite,
    /// Non-blocking work that completes asynchronously.
    CpuLiteAsync,
    /// Long computations.
    CpuIntensive,
}

impl ProcessingType {
    /// The hint inner pipelines schedule with. `CpuLite` never blocks the
    /// calling thread, so it is promoted to `CpuLiteAsync`.
    pub fn scheduling_hint(self) -> ProcessingType {
        match self {
            ProcessingType::CpuLite => ProcessingType::CpuLiteAsync,
            other => other,
        }
    }

    /// True if work of this type runs on a blocking-capable thread.
    pub fn is_blocking_pool(self) -> bool {
        matches!(self, ProcessingType::Blocking | ProcessingType::CpuIntensive)
    }
}

impl fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingType::Blocking => write!(f, "BLOCKING"),
            ProcessingType::CpuLite => write!(f, "CPU_LITE"),
            ProcessingType::CpuLiteAsync => write!(f, "CPU_LITE_ASYNC"),
            ProcessingType::CpuIntensive => write!(f, "CPU_INTENSIVE"),
        }
    }
}

/// Runtime handles for each processing category.
///
/// By default all three point at the current runtime; blocking and
/// cpu-intensive work still leaves the async worker threads through
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct Schedulers {
    cpu_lite: Handle,
    blocking: Handle,
    cpu_intensive: Handle,
}

impl Schedulers {
    /// Use the current tokio runtime for every category.
    pub fn try_current() -> Result<Self, EngineError> {
        let handle =
            Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
        Ok(Self::uniform(handle))
    }

    /// Use one handle for every category.
    pub fn uniform(handle: Handle) -> Self {
        Self {
            cpu_lite: handle.clone(),
            blocking: handle.clone(),
            cpu_intensive: handle,
        }
    }

    pub fn with_cpu_lite(mut self, handle: Handle) -> Self {
        self.cpu_lite = handle;
        self
    }

    pub fn with_blocking(mut self, handle: Handle) -> Self {
        self.blocking = handle;
        self
    }

    pub fn with_cpu_intensive(mut self, handle: Handle) -> Self {
        self.cpu_intensive = handle;
        self
    }

    /// The handle that serves a processing type.
    pub fn handle(&self, processing_type: ProcessingType) -> &Handle {
        match processing_type {
            ProcessingType::Blocking => &self.blocking,
            ProcessingType::CpuIntensive => &self.cpu_intensive,
            ProcessingType::CpuLite | ProcessingType::CpuLiteAsync => &self.cpu_lite,
        }
    }

    /// Run a synchronous job on the pool for `processing_type`.
    pub fn dispatch<F>(&self, processing_type: ProcessingType, job: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle(processing_type);
        if processing_type.is_blocking_pool() {
            handle.spawn_blocking(job)
        } else {
            handle.spawn(async move { job() })
        }
    }

    /// Spawn a long-lived async task on the pool for `processing_type`.
    pub fn spawn<F>(&self, processing_type: ProcessingType, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle(processing_type).spawn(future)
    }
}
