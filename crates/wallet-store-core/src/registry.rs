//! Handle registry.
//!
//! Maps opaque integer handles to engine-owned values. Handles behave like
//! file descriptors: allocated from a monotonic counter, never reused while
//! the process lives, and released only by an explicit free from the caller.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

/// Concurrent handle-to-value map with monotonic handle allocation.
///
/// Each handle class (storage, record, metadata, search) gets its own
/// registry and therefore its own counter. Values that are shared across
/// callers should be stored as `Arc<T>` so `get` stays cheap.
pub struct Registry<T: Clone> {
    entries: DashMap<i64, T>,
    next: AtomicI64,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicI64::new(1),
        }
    }

    /// Allocate a fresh handle for `value`.
    pub fn insert(&self, value: T) -> i64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(handle, value);
        handle
    }

    /// Look up a handle, cloning the stored value.
    pub fn get(&self, handle: i64) -> Option<T> {
        self.entries.get(&handle).map(|entry| entry.value().clone())
    }

    /// Release a handle, returning its value if it was live.
    pub fn remove(&self, handle: i64) -> Option<T> {
        self.entries.remove(&handle).map(|(_, value)| value)
    }

    /// Snapshot of all live values (used to check open sessions on delete).
    pub fn values(&self) -> Vec<T> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
