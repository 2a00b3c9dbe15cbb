//! Thread-local "current module" scope.
//!
//! Executors belong to a module (the plugin that provides them). Whatever
//! module is current on a thread is the one whose resources the running code
//! sees. The engine enters the component's module around executor invocation,
//! and deferred callbacks restore the module that was current when the
//! result was produced.
//!
//! ```ignore
//! let _scope = exec_scope::enter(model.module().clone());
//! executor.execute(ctx, callback); // current_module() == model.module()
//! // previous module restored when `_scope` drops
//! ```

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

/// Identity of a module (plugin) that provides executors.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ModuleId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

thread_local! {
    static CURRENT_MODULE: RefCell<Option<ModuleId>> = const { RefCell::new(None) };
}

/// The module current on this thread, if any.
pub fn current_module() -> Option<ModuleId> {
    CURRENT_MODULE.with(|current| current.borrow().clone())
}

/// Make `module` current until the returned guard drops.
pub fn enter(module: Option<ModuleId>) -> ModuleGuard {
    let previous = CURRENT_MODULE.with(|current| current.replace(module));
    ModuleGuard {
        previous,
        _not_send: std::marker::PhantomData,
    }
}

/// Run `f` with `module` current.
pub fn with_module<R>(module: Option<ModuleId>, f: impl FnOnce() -> R) -> R {
    let _guard = enter(module);
    f()
}

/// Restores the previously current module on drop.
///
/// Not `Send`: the guard must drop on the thread that created it.
#[must_use = "the module is only current while the guard is alive"]
pub struct ModuleGuard {
    previous: Option<ModuleId>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for ModuleGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_MODULE.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_restores_previous_module() {
        assert_eq!(current_module(), None);
        {
            let _outer = enter(Some("outer".into()));
            assert_eq!(current_module(), Some("outer".into()));
            {
                let _inner = enter(Some("inner".into()));
                assert_eq!(current_module(), Some("inner".into()));
            }
            assert_eq!(current_module(), Some("outer".into()));
        }
        assert_eq!(current_module(), None);
    }

    #[test]
    fn test_with_module_returns_value() {
        let seen = with_module(Some("db".into()), current_module);
        assert_eq!(seen, Some(ModuleId::new("db")));
        assert_eq!(current_module(), None);
    }

    #[test]
    fn test_modules_are_thread_local() {
        let _guard = enter(Some("main".into()));
        let other = std::thread::spawn(current_module).join().unwrap();
        assert_eq!(other, None);
    }
}
