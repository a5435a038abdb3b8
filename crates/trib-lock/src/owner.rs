//! Lock owner identity.
//!
//! An [`OwnerContext`] names the logical caller a lock is held for: the
//! current thread plus an optional label. Reentrancy checks compare contexts
//! by identity-equivalence of both parts, so two labels on the same thread
//! are distinct owners — which is also how single-threaded tests simulate
//! cross-owner contention.
//!
//! The context is established per logical unit of work and cleared by the
//! caller (scope drop or explicit [`OwnerContext::clear`]); the lock manager
//! only ever reads it.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

thread_local! {
    static CURRENT: RefCell<Option<OwnerContext>> = const { RefCell::new(None) };
}

/// Identity a lock is held for: thread plus optional label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerContext {
    thread: ThreadId,
    label: Option<Arc<str>>,
}

impl OwnerContext {
    fn unlabeled() -> Self {
        Self {
            thread: thread::current().id(),
            label: None,
        }
    }

    /// A labeled context for the calling thread.
    pub fn labeled(label: impl AsRef<str>) -> Self {
        Self {
            thread: thread::current().id(),
            label: Some(Arc::from(label.as_ref())),
        }
    }

    /// The active context for the calling thread.
    ///
    /// Falls back to a default context (thread identity, no label) when none
    /// has been established.
    pub fn current() -> Self {
        CURRENT
            .with(|slot| slot.borrow().clone())
            .unwrap_or_else(Self::unlabeled)
    }

    /// Establish `label` as the calling thread's identity until the returned
    /// scope is dropped; the previous identity (if any) is restored then.
    pub fn establish(label: impl AsRef<str>) -> OwnerScope {
        let ctx = Self::labeled(label);
        let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx));
        OwnerScope { previous }
    }

    /// Explicitly clear the calling thread's established identity.
    pub fn clear() {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }

    /// Identity-equivalence of thread plus label.
    pub fn is_same_owner(a: &OwnerContext, b: &OwnerContext) -> bool {
        a == b
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl fmt::Display for OwnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}@{:?}", label, self.thread),
            None => write!(f, "{:?}", self.thread),
        }
    }
}

/// Scope guard for an established owner identity.
#[must_use = "the owner identity is restored when the scope is dropped"]
pub struct OwnerScope {
    previous: Option<OwnerContext>,
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}
