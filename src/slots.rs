//! Per-thread slot store.
//!
//! A fixed-size array of `P` slots, one per worker, each holding an
//! opaque pointer-sized word. No synchronization is applied: slot `i`
//! is read and written only by the worker that owns `pool_id == i`, so
//! there is no concurrent access to guard against. This backs both the
//! "current epoch owned by this worker" cell used by [`crate::tracker`]
//! and the per-worker fast-path index array used by the `_fast`
//! instrumented accesses.

use std::cell::UnsafeCell;

/// An array of `P` single-writer slots, each holding a `usize`-wide
/// opaque word (an epoch number, a pointer cast to `usize`, or 0).
pub struct SlotStore {
    slots: Box<[UnsafeCell<usize>]>,
}

// SAFETY: each slot is touched only by the worker owning that index;
// callers uphold that discipline (the pool never hands two workers the
// same `pool_id`).
unsafe impl Sync for SlotStore {}
unsafe impl Send for SlotStore {}

impl SlotStore {
    /// Create a store with `count` slots, all initialized to zero.
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read the slot for `pool_id`.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`, or while no
    /// other thread can be concurrently writing it.
    #[inline]
    pub unsafe fn get(&self, pool_id: usize) -> usize {
        *self.slots[pool_id].get()
    }

    /// Write the slot for `pool_id`.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`.
    #[inline]
    pub unsafe fn set(&self, pool_id: usize, value: usize) {
        *self.slots[pool_id].get() = value;
    }

    /// Reset every slot to zero. Must be called with no worker active
    /// (e.g. before dispatching a fresh `exec_simple`).
    pub fn reset_all(&self) {
        for slot in self.slots.iter() {
            unsafe { *slot.get() = 0 };
        }
    }
}

/// A fast-path index: one [`SlotStore`] per worker, each sized to hold
/// `index_count` record-pointer slots (stored as `usize`, 0 meaning
/// "unresolved").
pub struct FastPathIndex {
    per_worker: Box<[SlotStore]>,
    index_count: usize,
}

impl FastPathIndex {
    pub fn new(worker_count: usize, index_count: usize) -> Self {
        Self {
            per_worker: (0..worker_count).map(|_| SlotStore::new(index_count)).collect(),
            index_count,
        }
    }

    #[inline]
    pub fn index_count(&self) -> usize {
        self.index_count
    }

    /// Fetch the cached record pointer (as `usize`, 0 = unset) for
    /// `(pool_id, index_id)`.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`.
    #[inline]
    pub unsafe fn get(&self, pool_id: usize, index_id: usize) -> usize {
        self.per_worker[pool_id].get(index_id)
    }

    /// Install a cached record pointer for `(pool_id, index_id)`.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`.
    #[inline]
    pub unsafe fn set(&self, pool_id: usize, index_id: usize, value: usize) {
        self.per_worker[pool_id].set(index_id, value);
    }

    /// Clear every worker's index. Must be called between
    /// `exec_simple` invocations, since a cached pointer from a prior
    /// run is not valid across a reset (see the index-lifetime note in
    /// the design).
    pub fn reset(&self) {
        for store in self.per_worker.iter() {
            store.reset_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_store_roundtrip() {
        let store = SlotStore::new(4);
        unsafe {
            store.set(0, 10);
            store.set(3, 99);
        }
        unsafe {
            assert_eq!(store.get(0), 10);
            assert_eq!(store.get(1), 0);
            assert_eq!(store.get(3), 99);
        }
    }

    #[test]
    fn slot_store_reset() {
        let store = SlotStore::new(2);
        unsafe { store.set(1, 42) };
        store.reset_all();
        unsafe { assert_eq!(store.get(1), 0) };
    }

    #[test]
    fn fast_path_index_per_worker_isolation() {
        let idx = FastPathIndex::new(2, 8);
        unsafe {
            idx.set(0, 3, 111);
            idx.set(1, 3, 222);
        }
        unsafe {
            assert_eq!(idx.get(0, 3), 111);
            assert_eq!(idx.get(1, 3), 222);
        }
        idx.reset();
        unsafe {
            assert_eq!(idx.get(0, 3), 0);
            assert_eq!(idx.get(1, 3), 0);
        }
    }
}
