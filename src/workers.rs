//! Worker pool: a fixed set of OS threads, each pinned to a distinct
//! CPU core, that drive the per-worker epoch loop described in
//! [`crate::driver`].
//!
//! The pool is built once per [`crate::driver::Runtime`] and reused
//! across every `exec_simple` call: each call hands the pool a fresh
//! task closure and uses the teacher's one-shot [`crate::barrier::Barrier`]
//! twice — once to release the workers into the new task, once to wait
//! for them all to finish it — rather than spawning new threads per
//! call.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backoff::Backoff;
use crate::barrier::Barrier;
use crate::error::RuntimeError;

type Task = dyn Fn(usize) + Send + Sync;

/// A fixed-size, CPU-pinned thread pool that runs one task at a time,
/// broadcast to every worker.
pub struct WorkerPool {
    thread_count: usize,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

struct Shared {
    start: Barrier,
    done: Barrier,
    task: AtomicPtr<Task>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Spawn `thread_count` workers, pinned to the first `thread_count`
    /// CPU cores reported by the OS (falling back to no pinning if
    /// affinity information isn't available on this platform).
    ///
    /// Fails with [`RuntimeError::SystemResource`] rather than panicking
    /// if the OS refuses to spawn one of the worker threads.
    pub fn new(thread_count: usize) -> Result<Self, RuntimeError> {
        debug_assert!(thread_count > 0, "worker pool requires at least one thread");

        let shared = Arc::new(Shared {
            // thread_count + 1: every worker, plus the dispatching
            // thread, rendezvous at both barriers.
            start: Barrier::new(thread_count + 1),
            done: Barrier::new(thread_count + 1),
            task: AtomicPtr::new(std::ptr::null_mut()),
            shutdown: AtomicBool::new(false),
        });

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let handles = (0..thread_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let core_id = core_ids.get(worker_id % core_ids.len().max(1)).copied();
                std::thread::Builder::new()
                    .name(format!("spec-exec-worker-{worker_id}"))
                    .spawn(move || {
                        if let Some(core_id) = core_id {
                            core_affinity::set_for_current(core_id);
                        }
                        worker_loop(worker_id, &shared);
                    })
                    .map_err(|e| {
                        RuntimeError::SystemResource(format!(
                            "failed to spawn worker thread {worker_id}: {e}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;

        Ok(Self {
            thread_count,
            handles,
            shared,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Broadcast `task` to every worker (called with that worker's
    /// `pool_id`) and block until all of them return from it.
    ///
    /// `task` may borrow from the caller's stack (it need not be
    /// `'static`): this call does not return until every worker has
    /// finished running it, via the `done` barrier below, so the
    /// borrow cannot be used after it expires. This is the same
    /// scoped-callback argument `std::thread::scope` makes; we can't
    /// use `std::thread::scope` itself because it spawns fresh threads
    /// per call; this pool's whole point is to keep CPU-pinned threads
    /// alive across calls.
    pub fn run_broadcast<'a, F: Fn(usize) + Send + Sync + 'a>(&'a self, task: F) {
        let boxed: Box<dyn Fn(usize) + Send + Sync + 'a> = Box::new(task);
        let raw: *mut (dyn Fn(usize) + Send + Sync + 'a) = Box::into_raw(boxed);
        // SAFETY: erasing the borrow to 'static is sound only because we
        // block below until every worker thread has returned from the
        // task, before the box is freed.
        let erased: *mut Task = unsafe { std::mem::transmute(raw) };
        self.shared.task.store(erased, Ordering::Release);

        self.shared.start.wait();
        self.shared.done.wait();

        self.shared.task.store(std::ptr::null_mut(), Ordering::Release);
        unsafe { drop(Box::from_raw(raw)) };
    }
}

fn worker_loop(worker_id: usize, shared: &Arc<Shared>) {
    loop {
        shared.start.wait();

        if shared.shutdown.load(Ordering::Acquire) {
            shared.done.wait();
            return;
        }

        let mut backoff = Backoff::new();
        let task_ptr = loop {
            let p = shared.task.load(Ordering::Acquire);
            if !p.is_null() {
                break p;
            }
            backoff.spin();
        };
        let task = unsafe { &*task_ptr };
        task(worker_id);

        shared.done.wait();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.start.wait();
        self.shared.done.wait();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
