//! Lifecycle management for streamable results.
//!
//! An executor may return an open stream (a [`CursorStreamProvider`]). Once
//! such a value enters an event it is registered with the
//! [`StreamingManager`], which closes it when the event's context completes,
//! whether or not anything downstream ever read it.
//!
//! ```text
//! manage(provider, ctx) ──► tracked ──ctx completes──► provider.close()
//!         │                                                  │
//!         └── already managed? no-op                 untracked, closed += 1
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::event::EventContext;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for a stream provider.
pub fn next_provider_id() -> u64 {
    NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed)
}

/// An open, re-readable stream of values.
pub trait CursorStreamProvider: Send + Sync + fmt::Debug + 'static {
    /// Process-unique identity, used for deduplication.
    fn id(&self) -> u64;

    /// Open a new cursor over the stream. Fails once closed.
    fn open_cursor(&self) -> anyhow::Result<Box<dyn Iterator<Item = serde_json::Value> + Send>>;

    /// Release the underlying resource. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A stream provider over an in-memory buffer.
#[derive(Debug)]
pub struct InMemoryCursorStreamProvider {
    id: u64,
    items: Arc<Vec<serde_json::Value>>,
    closed: AtomicBool,
}

impl InMemoryCursorStreamProvider {
    pub fn new(items: Vec<serde_json::Value>) -> Self {
        Self {
            id: next_provider_id(),
            items: Arc::new(items),
            closed: AtomicBool::new(false),
        }
    }
}

impl CursorStreamProvider for InMemoryCursorStreamProvider {
    fn id(&self) -> u64 {
        self.id
    }

    fn open_cursor(&self) -> anyhow::Result<Box<dyn Iterator<Item = serde_json::Value> + Send>> {
        if self.is_closed() {
            bail!("stream #{} is closed", self.id);
        }
        let items = self.items.clone();
        Ok(Box::new((0..items.len()).map(move |i| items[i].clone())))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Counters reported by a [`StreamingManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamingStats {
    /// Providers currently tracked.
    pub open: usize,
    /// Providers ever registered.
    pub managed: u64,
    /// Providers closed by the manager.
    pub closed: u64,
}

#[derive(Default)]
struct ManagerInner {
    providers: DashMap<u64, Arc<dyn CursorStreamProvider>>,
    managed: AtomicU64,
    closed: AtomicU64,
}

impl ManagerInner {
    fn close(&self, id: u64) {
        if let Some((_, provider)) = self.providers.remove(&id) {
            provider.close();
            self.closed.fetch_add(1, Ordering::AcqRel);
            trace!(provider = id, "closed managed stream");
        }
    }
}

/// Ties open streams to the event contexts that produced them.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct StreamingManager {
    inner: Arc<ManagerInner>,
}

impl StreamingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `provider` until `context` completes. Re-registering an
    /// already managed provider is a no-op.
    pub fn manage(&self, provider: Arc<dyn CursorStreamProvider>, context: &EventContext) {
        let id = provider.id();
        {
            match self.inner.providers.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => return,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(provider);
                }
            }
        }
        self.inner.managed.fetch_add(1, Ordering::AcqRel);
        debug!(provider = id, context = %context.id(), "managing stream");

        let inner = Arc::downgrade(&self.inner);
        context.on_complete(move |_| {
            if let Some(inner) = inner.upgrade() {
                inner.close(id);
            }
        });
    }

    pub fn is_managed(&self, provider: &dyn CursorStreamProvider) -> bool {
        self.inner.providers.contains_key(&provider.id())
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            open: self.inner.providers.len(),
            managed: self.inner.managed.load(Ordering::Acquire),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    /// Close every stream still open.
    pub fn dispose(&self) {
        let ids: Vec<u64> = self.inner.providers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.inner.close(id);
        }
    }
}

impl fmt::Debug for StreamingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingManager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> Arc<dyn CursorStreamProvider> {
        Arc::new(InMemoryCursorStreamProvider::new(vec![json!(1), json!(2)]))
    }

    #[test]
    fn test_closed_when_context_completes_even_if_unread() {
        let manager = StreamingManager::new();
        let ctx = EventContext::new();
        let stream = provider();

        manager.manage(stream.clone(), &ctx);
        assert!(manager.is_managed(stream.as_ref()));
        assert!(!stream.is_closed());

        ctx.success();
        assert!(stream.is_closed());
        assert_eq!(
            manager.stats(),
            StreamingStats {
                open: 0,
                managed: 1,
                closed: 1
            }
        );
    }

    #[test]
    fn test_reregistration_is_noop() {
        let manager = StreamingManager::new();
        let ctx = EventContext::new();
        let stream = provider();

        manager.manage(stream.clone(), &ctx);
        manager.manage(stream.clone(), &ctx);
        assert_eq!(manager.stats().managed, 1);

        ctx.success();
        assert_eq!(manager.stats().closed, 1);
    }

    #[test]
    fn test_cursor_reads_until_closed() {
        let stream = provider();
        let values: Vec<_> = stream.open_cursor().unwrap().collect();
        assert_eq!(values, vec![json!(1), json!(2)]);

        stream.close();
        assert!(stream.open_cursor().is_err());
    }

    #[test]
    fn test_dispose_closes_everything_open() {
        let manager = StreamingManager::new();
        let streams: Vec<_> = (0..3).map(|_| provider()).collect();
        for stream in &streams {
            manager.manage(stream.clone(), &EventContext::new());
        }

        manager.dispose();
        assert!(streams.iter().all(|s| s.is_closed()));
        assert_eq!(manager.stats().open, 0);
        assert_eq!(manager.stats().closed, 3);
    }
}
