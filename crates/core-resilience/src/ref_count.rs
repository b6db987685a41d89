//! Reference counting with on-zero hooks for asynchronously torn-down resources
//!
//! A resource with async cleanup cannot be freed the moment its owner lets
//! go: in-flight work referencing it must first drain. `RefCount` tracks
//! those outstanding references and runs a one-shot hook when the count
//! reaches zero, so the final cleanup step can be scheduled from whichever
//! thread dropped the last reference.
//!
//! The intended pattern is a *pair* of counters per top-level resource: an
//! external count held by user-facing handles and an internal count held by
//! owned subresources. The external count hitting zero starts teardown; the
//! internal count hitting zero means teardown has finished. Collapsing the
//! two into one counter would block cleanup from starting while internal
//! work is still outstanding.
//!
//! # Example
//!
//! ```
//! use slingshot_core_resilience::ref_count::RefCount;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let done_clone = Arc::clone(&done);
//!
//! let refs = RefCount::with_hook(1, move || {
//!     done_clone.store(true, Ordering::SeqCst);
//! });
//!
//! refs.acquire();
//! assert_eq!(refs.release(), 1);
//! assert!(!done.load(Ordering::SeqCst));
//!
//! assert_eq!(refs.release(), 0);
//! assert!(done.load(Ordering::SeqCst));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type OnZero = Box<dyn FnOnce() + Send>;

/// An atomic reference count with a one-shot on-zero hook.
///
/// The hook fires on the thread that releases the last reference, exactly
/// once. Callers that can reach a *transient* zero (count bouncing 0 → 1 → 0
/// while the resource is still live) must hold a guard reference for the
/// resource's whole lifetime so zero is only reached at true end-of-life.
pub struct RefCount {
    count: AtomicUsize,
    on_zero: Mutex<Option<OnZero>>,
}

impl RefCount {
    /// Create a counter with an initial count and no hook.
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
            on_zero: Mutex::new(None),
        }
    }

    /// Create a counter with an initial count and an on-zero hook.
    pub fn with_hook<F>(initial: usize, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            count: AtomicUsize::new(initial),
            on_zero: Mutex::new(Some(Box::new(hook))),
        }
    }

    /// Install or replace the on-zero hook.
    ///
    /// Must be installed while the count is still non-zero; a hook installed
    /// after the count already hit zero never fires.
    pub fn set_on_zero<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.on_zero.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(hook));
    }

    /// Take one reference.
    pub fn acquire(&self) {
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev != usize::MAX, "ref count overflow");
    }

    /// Release one reference, returning the new count.
    ///
    /// When the count transitions to zero the hook (if any) runs on the
    /// calling thread before this returns.
    pub fn release(&self) -> usize {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "ref count released below zero");

        let remaining = prev - 1;
        if remaining == 0 {
            let hook = {
                let mut slot = self.on_zero.lock().unwrap_or_else(|e| e.into_inner());
                slot.take()
            };
            if let Some(hook) = hook {
                hook();
            }
        }
        remaining
    }

    /// Current count. Only a snapshot; other threads may change it
    /// immediately after the load.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RefCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCount")
            .field("count", &self.count())
            .finish()
    }
}
