use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use indexmap::IndexMap;

/// Registration handle returned by [`GuardedCallbackList::add`]. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

/// Ordered registry of subscriber callbacks.
///
/// Invocation works on a snapshot that is copied while the lock is held, the callbacks themselves
/// run after the lock is released. A callback may therefore add or remove entries (including
/// itself) while it runs, and `add` / `remove` never wait on a running callback.
pub struct GuardedCallbackList<T> {
    entries: Mutex<IndexMap<CallbackHandle, T>>,
    next_handle: AtomicU64,
}

impl<T: Clone> GuardedCallbackList<T> {
    pub fn new() -> Self {
        GuardedCallbackList {
            entries: Mutex::new(IndexMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<CallbackHandle, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, callback: T) -> CallbackHandle {
        let handle = CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries().insert(handle, callback);
        handle
    }

    /// Returns false if the handle was not (or no longer) registered.
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        // shift_remove keeps the insertion order of the remaining entries
        self.entries().shift_remove(&handle).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries().values().cloned().collect()
    }

    /// Calls `invoke` for every callback registered at the moment of the call, in insertion order.
    pub fn invoke_all<F>(&self, mut invoke: F)
    where
        F: FnMut(&T),
    {
        let snapshot = self.snapshot();
        for callback in &snapshot {
            invoke(callback);
        }
    }
}

impl<T: Clone> Default for GuardedCallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}
