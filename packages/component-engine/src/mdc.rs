//! Thread-local diagnostic context (correlation id and processor path).
//!
//! Values are attached to the thread that actually invokes an executor, right
//! before invocation, and removed when the returned guard drops. The
//! processor path is only set when absent so an enclosing component's path
//! wins for nested invocations.

use std::cell::RefCell;
use std::collections::BTreeMap;

pub const CORRELATION_ID_KEY: &str = "correlationId";
pub const PROCESSOR_PATH_KEY: &str = "processorPath";

thread_local! {
    static CONTEXT: RefCell<BTreeMap<&'static str, String>> = const { RefCell::new(BTreeMap::new()) };
}

pub fn get(key: &'static str) -> Option<String> {
    CONTEXT.with(|ctx| ctx.borrow().get(key).cloned())
}

/// Snapshot of the whole diagnostic context on this thread.
pub fn snapshot() -> BTreeMap<&'static str, String> {
    CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Set `key`, restoring its previous value when the guard drops.
pub fn put(key: &'static str, value: impl Into<String>) -> MdcGuard {
    let previous = CONTEXT.with(|ctx| ctx.borrow_mut().insert(key, value.into()));
    MdcGuard {
        key,
        previous,
        _not_send: std::marker::PhantomData,
    }
}

/// Set `key` only if it has no value. Returns a guard only if it was set.
pub fn put_if_absent(key: &'static str, value: impl Into<String>) -> Option<MdcGuard> {
    if get(key).is_some() {
        return None;
    }
    Some(put(key, value))
}

/// Restores a diagnostic key on drop.
#[must_use = "the value is removed as soon as the guard drops"]
pub struct MdcGuard {
    key: &'static str,
    previous: Option<String>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for MdcGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            match previous {
                Some(value) => {
                    ctx.insert(self.key, value);
                }
                None => {
                    ctx.remove(self.key);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_restores_on_drop() {
        {
            let _guard = put(CORRELATION_ID_KEY, "abc");
            assert_eq!(get(CORRELATION_ID_KEY).as_deref(), Some("abc"));
            {
                let _nested = put(CORRELATION_ID_KEY, "def");
                assert_eq!(get(CORRELATION_ID_KEY).as_deref(), Some("def"));
            }
            assert_eq!(get(CORRELATION_ID_KEY).as_deref(), Some("abc"));
        }
        assert_eq!(get(CORRELATION_ID_KEY), None);
    }

    #[test]
    fn test_put_if_absent_keeps_outer_value() {
        let outer = put_if_absent(PROCESSOR_PATH_KEY, "flow/processors/0");
        assert!(outer.is_some());
        let inner = put_if_absent(PROCESSOR_PATH_KEY, "flow/processors/0/route/1");
        assert!(inner.is_none());
        assert_eq!(
            get(PROCESSOR_PATH_KEY).as_deref(),
            Some("flow/processors/0")
        );
        drop(outer);
        assert!(snapshot().is_empty());
    }
}
