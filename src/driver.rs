//! The top-level runtime: wires the sequencer, tracker, and worker pool
//! together into a single speculative `for`-loop driver.
//!
//! `Runtime` is a plain, heap-free-of-globals handle — the design note
//! that a single process may want more than one independent speculative
//! region running concurrently is honored by making every method take
//! `&self` rather than reaching for a static. [`init`]/[`destroy`] exist
//! only as an optional, globally-shared convenience wrapper for callers
//! that want the classic single-instance C-library shape.

use std::ffi::c_void;
use std::sync::{Mutex, OnceLock};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::sequencer::EpochSequencer;
use crate::slots::{FastPathIndex, SlotStore};
use crate::tracker::DependencyTracker;
use crate::workers::WorkerPool;

/// What an iteration's body tells the runtime to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The iteration finished normally; continue the loop.
    Continue,
    /// Stop the loop after this iteration (no error).
    Break,
    /// The iteration failed; stop the loop and roll back.
    Error,
}

/// A loop body: given the iteration index and the caller's opaque
/// `user_data`, runs one iteration (using `Runtime::dep_load`/`dep_store`
/// for every access to state shared across iterations) and reports what
/// should happen next.
pub trait Executor: Fn(usize, *mut c_void) -> ExecOutcome + Send + Sync {}
impl<F: Fn(usize, *mut c_void) -> ExecOutcome + Send + Sync> Executor for F {}

/// Largest `E_MAX` the packed `(read_bits, write_bits)` representation
/// in [`crate::record::Record`] can support.
const MAX_E_MAX: usize = crate::record::MAX_E_MAX;

fn floor_power_of_two(n: usize) -> u32 {
    if n <= 1 {
        return 1;
    }
    let bits = usize::BITS - n.leading_zeros();
    1u32 << (bits - 1)
}

/// An independent thread-level-speculative loop execution runtime.
pub struct Runtime {
    config: RuntimeConfig,
    thread_count: usize,
    sequencer: EpochSequencer,
    tracker: DependencyTracker,
    /// Per-worker "which epoch am I currently executing" cell, read by
    /// `dep_load`/`dep_store` so the executor closure doesn't need to
    /// pass the epoch through explicitly.
    current_epoch: SlotStore,
    fast_index: FastPathIndex,
    workers: WorkerPool,
    /// Set by `dep_load`/`dep_store`/`dep_load_fast`/`dep_store_fast`
    /// when the dependency tracker can't satisfy a record allocation.
    /// Cleared at the start of every `exec_simple` call and surfaced at
    /// the end, the same way `first_error` surfaces an executor-reported
    /// `ExecOutcome::Error` for that one call.
    fatal: Mutex<Option<RuntimeError>>,
}

impl Runtime {
    /// Build a runtime from `config`. Fails if the derived `E_MAX`
    /// (`min(32, 2 * thread_count)`, rounded down to a power of two)
    /// would not exceed the thread count — the ring needs at least one
    /// spare slot per worker to avoid every worker immediately blocking
    /// on `next_epoch`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let thread_count = config.resolved_thread_count();
        if thread_count == 0 {
            log::error!("runtime configuration rejected: thread_count resolved to zero");
            return Err(RuntimeError::Configuration("thread_count resolved to zero"));
        }

        let raw = (2 * thread_count).min(MAX_E_MAX);
        let e_max = floor_power_of_two(raw);
        if e_max as usize <= thread_count {
            log::error!(
                "runtime configuration rejected: e_max={e_max} does not exceed thread_count={thread_count}"
            );
            return Err(RuntimeError::Configuration(
                "E_MAX derived from thread_count does not leave spare ring capacity",
            ));
        }

        log::debug!(
            "initializing runtime: thread_count={thread_count} e_max={e_max} ws_capacity_hint={}",
            config.ws_capacity_hint
        );

        Ok(Self {
            sequencer: EpochSequencer::new(e_max),
            tracker: DependencyTracker::new(thread_count, e_max as usize, config.ws_capacity_hint),
            current_epoch: SlotStore::new(thread_count),
            fast_index: FastPathIndex::new(thread_count, config.index_count),
            workers: WorkerPool::new(thread_count)?,
            thread_count,
            config,
            fatal: Mutex::new(None),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one speculative loop to completion: workers pull epochs from
    /// the sequencer, execute `executor` against `user_data`, and
    /// commit or roll back in epoch order, until `executor` returns
    /// `Break`/`Error` or the caller's iteration space is exhausted
    /// (signalled by the executor itself calling `stop_at` via a
    /// future epoch count — in this simple driver, by returning `Break`).
    pub fn exec_simple<E: Executor>(&self, executor: E, user_data: *mut c_void) -> Result<(), RuntimeError> {
        use crate::sequencer::PriorStatus;

        self.fast_index.reset();
        *self.fatal.lock().unwrap() = None;
        let user_data = SendPtr(user_data);
        let first_error: std::sync::Mutex<Option<u64>> = Mutex::new(None);

        self.workers.run_broadcast(|pool_id| {
            let user_data = user_data.0;
            loop {
                let Some((epoch, prior)) = self.sequencer.next_epoch() else {
                    break;
                };

                if prior == PriorStatus::Retry {
                    unsafe { self.tracker.rollback(&self.sequencer, epoch) };
                    self.sequencer.rollback_done(epoch);
                }

                unsafe { self.current_epoch.set(pool_id, epoch as usize) };

                // The executor receives its caller's `pool_id`, not the
                // epoch: the epoch is internal bookkeeping, and whatever
                // "iteration index" the loop body cares about is state
                // the executor tracks itself via dep_load/dep_store (see
                // the accumulator pattern in the module doc example).
                let outcome = (executor)(pool_id, user_data);

                match outcome {
                    ExecOutcome::Error => {
                        // The erroring epoch still commits normally (its
                        // partial writes are whatever the executor made
                        // before failing) so the commit queue keeps
                        // draining in order; only *new* epoch hand-out
                        // is halted, at the epoch right after this one.
                        self.sequencer.stop_at(epoch + 1);
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(epoch);
                        }
                    }
                    ExecOutcome::Break => {
                        self.sequencer.stop_at(epoch + 1);
                    }
                    ExecOutcome::Continue => {}
                }

                if self.sequencer.set_done(epoch) {
                    // Flagged for rollback while executing: abandon it.
                    // Whoever reclaims this epoch via `next_epoch` next
                    // (`PriorStatus::Retry`) performs the cleanup.
                    continue;
                }

                // Non-blocking drain: apply every epoch that is now
                // ready to commit, not just the one this worker just
                // ran. Any worker may drain any ready epoch, so this
                // never stalls a worker on its own epoch's turn at the
                // head of the ring; it just loops back to claim a fresh
                // epoch once nothing is immediately ready.
                while let Some((e, _)) = self.sequencer.next_commit() {
                    unsafe { self.tracker.commit(&self.sequencer, e) };
                    self.sequencer.commit_done(e);
                }
            }
        });

        if let Some(err) = self.fatal.lock().unwrap().take() {
            return Err(err);
        }

        match first_error.into_inner().unwrap() {
            Some(epoch) => {
                log::warn!("exec_simple halted: executor reported an error at epoch {epoch}");
                Err(RuntimeError::ExecutorError(epoch))
            }
            None => {
                log::debug!("exec_simple completed without error");
                Ok(())
            }
        }
    }

    /// Record a fatal allocation failure surfaced by the dependency
    /// tracker, and halt hand-out of further epochs at `epoch + 1` (the
    /// same way an `ExecOutcome::Error` halts the loop) so the run
    /// drains to completion instead of growing the failure.
    fn record_fatal(&self, epoch: u64, err: RuntimeError) {
        self.sequencer.stop_at(epoch + 1);
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            log::error!("exec_simple halting at epoch {epoch}: {err}");
            *slot = Some(err);
        }
    }

    /// Speculative load of `src_addr`, attributed to the epoch the
    /// calling worker (`pool_id`) currently owns.
    ///
    /// # Safety
    /// Must be called only from within the `executor` passed to
    /// `exec_simple`, with the `pool_id` that closure was invoked with.
    pub unsafe fn dep_load(&self, pool_id: usize, src_addr: usize) -> u64 {
        let epoch = self.current_epoch.get(pool_id) as u64;
        match self.tracker.load(&self.sequencer, pool_id, epoch, src_addr) {
            Ok(value) => value,
            Err(err) => {
                self.record_fatal(epoch, err);
                0
            }
        }
    }

    /// Speculative store of `value` to `dest_addr`, attributed to the
    /// epoch the calling worker (`pool_id`) currently owns.
    ///
    /// # Safety
    /// Same as [`Self::dep_load`].
    pub unsafe fn dep_store(&self, pool_id: usize, value: u64, dest_addr: usize) {
        let epoch = self.current_epoch.get(pool_id) as u64;
        if let Err(err) = self.tracker.store(&self.sequencer, pool_id, epoch, dest_addr, value) {
            self.record_fatal(epoch, err);
        }
    }

    /// Like [`Self::dep_load`], but caches the resolved record in the
    /// worker's fast-path index slot `index_id` so repeated accesses to
    /// the same address within one `exec_simple` run skip the map
    /// probe. The index is cleared at the start of every `exec_simple`
    /// call, so a cached pointer never survives across runs.
    ///
    /// # Safety
    /// Same as [`Self::dep_load`], plus: `index_id` must be stable for
    /// a given logical address within one run (the caller, not the
    /// runtime, is responsible for that mapping).
    pub unsafe fn dep_load_fast(&self, pool_id: usize, index_id: usize, src_addr: usize) -> u64 {
        let epoch = self.current_epoch.get(pool_id) as u64;
        match self.fast_record(pool_id, index_id, src_addr, epoch) {
            Some(record) => self.tracker.load_record(&self.sequencer, epoch, record),
            None => 0,
        }
    }

    /// Like [`Self::dep_store`], with the same fast-path caching as
    /// [`Self::dep_load_fast`].
    ///
    /// # Safety
    /// Same as [`Self::dep_load_fast`].
    pub unsafe fn dep_store_fast(&self, pool_id: usize, index_id: usize, value: u64, dest_addr: usize) {
        let epoch = self.current_epoch.get(pool_id) as u64;
        if let Some(record) = self.fast_record(pool_id, index_id, dest_addr, epoch) {
            self.tracker.store_record(&self.sequencer, epoch, record, value);
        }
    }

    /// Resolve (and fast-path-cache) the record for `addr`, or `None` if
    /// the tracker couldn't allocate one — in which case a fatal error
    /// has already been recorded via `record_fatal` and the caller
    /// should treat this access as a no-op.
    unsafe fn fast_record(
        &self,
        pool_id: usize,
        index_id: usize,
        addr: usize,
        epoch: u64,
    ) -> Option<std::ptr::NonNull<crate::record::Record>> {
        let cached = self.fast_index.get(pool_id, index_id);
        if cached != 0 {
            return Some(std::ptr::NonNull::new_unchecked(cached as *mut crate::record::Record));
        }
        match self.tracker.resolve(pool_id, addr) {
            Ok(record) => {
                self.fast_index.set(pool_id, index_id, record.as_ptr() as usize);
                Some(record)
            }
            Err(err) => {
                self.record_fatal(epoch, err);
                None
            }
        }
    }
}

/// `*mut c_void` isn't `Send` by default; the runtime only ever reads
/// it back out on the same worker threads the pool already marks
/// `Send`, so wrapping it is sound.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

static GLOBAL_RUNTIME: OnceLock<Mutex<Option<Runtime>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Runtime>> {
    GLOBAL_RUNTIME.get_or_init(|| Mutex::new(None))
}

/// Initialize the process-global runtime singleton. Provided for
/// callers that want the classic single-instance shape instead of
/// owning a `Runtime` themselves; prefer `Runtime::new` directly when
/// more than one independent speculative region is needed.
pub fn init(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let runtime = Runtime::new(config)?;
    *global_slot().lock().unwrap() = Some(runtime);
    Ok(())
}

/// Tear down the process-global runtime singleton, if any.
pub fn destroy() {
    *global_slot().lock().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn exec_simple_runs_every_iteration() {
        let rt = Runtime::new(RuntimeConfig::new().with_thread_count(2)).unwrap();
        let n = 50u64;
        let touched: Vec<AtomicU64> = (0..n as usize).map(|_| AtomicU64::new(0)).collect();
        let addr_of = |i: usize| &touched[i] as *const AtomicU64 as usize;
        let counter = AtomicU64::new(0);
        let counter_addr = &counter as *const AtomicU64 as usize;

        rt.exec_simple(
            |pool_id, _| {
                let i = unsafe { rt.dep_load(pool_id, counter_addr) };
                unsafe { rt.dep_store(pool_id, i + 1, counter_addr) };
                if i >= n {
                    return ExecOutcome::Break;
                }
                unsafe { rt.dep_store(pool_id, 1, addr_of(i as usize)) };
                ExecOutcome::Continue
            },
            std::ptr::null_mut(),
        )
        .unwrap();

        assert!(touched.iter().all(|t| t.load(Ordering::Acquire) == 1));
    }

    /// Mirrors the accumulator-sum seed scenario (spec §8, S1):
    /// `i` counts iterations, `a` accumulates them, and the loop breaks
    /// once `i` exceeds `n`.
    #[test]
    fn accumulator_sum_matches_sequential_result() {
        let rt = Runtime::new(RuntimeConfig::new().with_thread_count(4)).unwrap();
        let n = 100u64;
        let i = AtomicU64::new(0);
        let a = AtomicU64::new(0);
        let i_addr = &i as *const AtomicU64 as usize;
        let a_addr = &a as *const AtomicU64 as usize;

        rt.exec_simple(
            |pool_id, _| {
                let mut cur = unsafe { rt.dep_load(pool_id, i_addr) };
                cur += 1;
                unsafe { rt.dep_store(pool_id, cur, i_addr) };
                if cur > n {
                    return ExecOutcome::Break;
                }
                let mut sum = unsafe { rt.dep_load(pool_id, a_addr) };
                sum += cur;
                unsafe { rt.dep_store(pool_id, sum, a_addr) };
                ExecOutcome::Continue
            },
            std::ptr::null_mut(),
        )
        .unwrap();

        assert_eq!(i.load(Ordering::Acquire), n + 1);
        assert_eq!(a.load(Ordering::Acquire), n * (n + 1) / 2);
    }

    #[test]
    fn executor_error_is_surfaced_and_halts() {
        let rt = Runtime::new(RuntimeConfig::new().with_thread_count(2)).unwrap();
        let counter = AtomicU64::new(0);
        let counter_addr = &counter as *const AtomicU64 as usize;
        let result = rt.exec_simple(
            |pool_id, _| {
                let i = unsafe { rt.dep_load(pool_id, counter_addr) };
                unsafe { rt.dep_store(pool_id, i + 1, counter_addr) };
                if i >= 3 {
                    ExecOutcome::Error
                } else {
                    ExecOutcome::Continue
                }
            },
            std::ptr::null_mut(),
        );
        assert!(matches!(result, Err(RuntimeError::ExecutorError(_))));
    }
}
