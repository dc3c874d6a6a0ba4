//! Pooled allocator: one free list per worker, caching fixed-size
//! objects so that repeatedly touching the same small set of addresses
//! across epochs doesn't thrash the global allocator.
//!
//! This is deliberately generic (`Pool<T, A>`) — the only concrete user
//! today is [`crate::map`], which pools [`crate::record::Record`]
//! candidates for the probe-or-insert path — but it is built on
//! [`crate::malloc::Allocator`] so it composes with a custom allocator
//! the same way the teacher's other structures (`Array`, `HashTable`)
//! take an `Allocator` type parameter.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::error::RuntimeError;
use crate::malloc::{Allocator, GlobalAllocator};

/// A free list of `T`, one per worker, with construct/destruct
/// callbacks supplied at each acquire/release rather than baked into
/// the pool itself.
pub struct Pool<T, A: Allocator = GlobalAllocator> {
    free_lists: Box<[UnsafeCell<Vec<NonNull<T>>>]>,
    allocator: A,
}

// SAFETY: each free list is only ever touched by the worker owning
// that index (the same single-writer discipline as `SlotStore`).
unsafe impl<T, A: Allocator + Sync> Sync for Pool<T, A> {}
unsafe impl<T, A: Allocator + Send> Send for Pool<T, A> {}

impl<T> Pool<T, GlobalAllocator> {
    /// Create a pool with `worker_count` empty free lists, backed by
    /// the global allocator.
    pub fn new(worker_count: usize) -> Self {
        Self::with_allocator(worker_count, GlobalAllocator)
    }
}

impl<T, A: Allocator> Pool<T, A> {
    pub fn with_allocator(worker_count: usize, allocator: A) -> Self {
        Self {
            free_lists: (0..worker_count)
                .map(|_| UnsafeCell::new(Vec::new()))
                .collect(),
            allocator,
        }
    }

    /// Acquire an object for `pool_id`: pops a cached object and runs
    /// `reuse` on it if the free list is non-empty, else allocates a
    /// fresh one via `construct`. Fails with [`RuntimeError::OutOfMemory`]
    /// rather than panicking if the backing allocator can't satisfy a
    /// fresh allocation.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`.
    pub unsafe fn acquire<C, R>(&self, pool_id: usize, construct: C, reuse: R) -> Result<NonNull<T>, RuntimeError>
    where
        C: FnOnce() -> T,
        R: FnOnce(&mut T),
    {
        let list = &mut *self.free_lists[pool_id].get();
        if let Some(mut ptr) = list.pop() {
            reuse(ptr.as_mut());
            Ok(ptr)
        } else {
            let raw = self
                .allocator
                .malloc(std::mem::size_of::<T>())
                .ok_or(RuntimeError::OutOfMemory)?
                .cast::<T>();
            raw.as_ptr().write(construct());
            Ok(raw)
        }
    }

    /// Return an object to `pool_id`'s free list after running
    /// `destruct` on it (e.g. to drop any resources it holds without
    /// deallocating the backing memory).
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`, and `ptr`
    /// must have come from this pool and not be referenced elsewhere.
    pub unsafe fn release<D>(&self, pool_id: usize, mut ptr: NonNull<T>, destruct: D)
    where
        D: FnOnce(&mut T),
    {
        destruct(ptr.as_mut());
        let list = &mut *self.free_lists[pool_id].get();
        list.push(ptr);
    }

    /// Number of cached (unused) objects across all workers.
    ///
    /// # Safety
    /// Caller must ensure no worker is concurrently mutating its list
    /// (e.g. called between `exec_simple` invocations).
    pub unsafe fn cached_len(&self) -> usize {
        self.free_lists.iter().map(|l| (*l.get()).len()).sum()
    }
}

impl<T, A: Allocator> Drop for Pool<T, A> {
    fn drop(&mut self) {
        for list in self.free_lists.iter() {
            let vec = unsafe { &mut *list.get() };
            for ptr in vec.drain(..) {
                unsafe {
                    std::ptr::drop_in_place(ptr.as_ptr());
                    self.allocator.free(ptr.cast::<u8>(), std::mem::size_of::<T>(), false);
                }
            }
        }
    }
}
