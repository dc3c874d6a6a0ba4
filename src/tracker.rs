//! Dependency tracker: per-address read/write bookkeeping, violation
//! detection, and load forwarding.
//!
//! `store` and `load` are the only operations a worker calls while
//! executing an epoch's loop body; `commit`/`rollback` replay the
//! epoch's touched-record list (threaded through
//! [`crate::record::Record::touched_next`]) once the epoch retires or
//! is discarded. Address resolution (`resolve`) is shared by both and
//! backed by [`crate::map::Map`] plus a [`crate::recordpool::Pool`] so
//! that repeatedly touching the same small working set across epochs
//! doesn't keep allocating fresh `Record`s.
//!
//! The touched-record list head is kept one per *ring slot*
//! (`epoch % e_max`), not one per worker: a rolled-back epoch can be
//! reclaimed and re-run by a different worker than the one that first
//! attempted it (see [`crate::sequencer`]), and the list has to be
//! findable by whichever worker ends up retiring or discarding it. The
//! ring's own capacity bound guarantees at most one live epoch per slot
//! at a time, so this is race-free without extra locking.
//!
//! Both `store` and `load` mask the record's `read_bits`/`write_bits`
//! against [`EpochSequencer::rollback_bitmap`] before walking them: a
//! ring slot flagged for rollback holds a dead epoch's stale flags
//! until that epoch is reclaimed and cleared, and treating those flags
//! as live would either spuriously trigger a rollback against a ghost
//! or forward a value from a write that is never going to happen.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bits::{epoch_le, epoch_lt, slot_to_epoch};
use crate::cc::ctz;
use crate::error::RuntimeError;
use crate::map::Map;
use crate::record::Record;
use crate::recordpool::Pool;
use crate::sequencer::EpochSequencer;
use crate::slots::SlotStore;

pub struct DependencyTracker {
    map: Map,
    pool: Pool<Record>,
    /// One slot per ring position: the head of the touched-record list
    /// for whichever epoch currently occupies that slot, or 0 when idle.
    touched_heads: SlotStore,
}

impl DependencyTracker {
    pub fn new(worker_count: usize, e_max: usize, capacity_hint: usize) -> Self {
        Self {
            map: Map::with_capacity_hint(capacity_hint),
            pool: Pool::new(worker_count),
            touched_heads: SlotStore::new(e_max),
        }
    }

    /// Number of distinct addresses interned so far.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Resolve `addr` to its interned record, installing a fresh one if
    /// this is the first time any worker has touched this address.
    /// Exposed so the fast-path index (see [`crate::driver`]) can cache
    /// the returned pointer and skip this lookup on later calls within
    /// the same run. Fails with [`RuntimeError::OutOfMemory`] if a fresh
    /// record can't be allocated.
    ///
    /// # Safety
    /// Must only be called by the worker owning `pool_id`.
    pub unsafe fn resolve(&self, pool_id: usize, addr: usize) -> Result<NonNull<Record>, RuntimeError> {
        let candidate = self
            .pool
            .acquire(pool_id, || Record::new(addr), |r| r.reset_for_reuse(addr))?;
        let installed = self.map.probe(addr, candidate);
        if installed != candidate {
            self.pool.release(pool_id, candidate, |_| {});
        }
        Ok(installed)
    }

    /// Link `record` onto `slot`'s touched list, but only the first time
    /// this epoch touches it — checked by whether either bit for `slot`
    /// is already set, which is race-free because `slot` has exactly one
    /// live epoch at a time.
    unsafe fn touch_if_new(&self, slot: u32, record: NonNull<Record>) {
        let r = record.as_ref();
        let bit = 1u32 << slot;
        if (r.read_bits() | r.write_bits()) & bit == 0 {
            let head = self.touched_heads.get(slot as usize) as *mut Record;
            r.set_touched_next(slot, head);
            self.touched_heads.set(slot as usize, record.as_ptr() as usize);
        }
    }

    /// Speculatively store `value` to `addr` under `epoch`. Detects and
    /// flags (via `seq.do_rollback`) any later epoch that already read
    /// this address before this store happened. Fails with
    /// [`RuntimeError::OutOfMemory`] if resolving `addr` requires a
    /// fresh record allocation that the allocator can't satisfy.
    ///
    /// # Safety
    /// Must only be called by the worker currently holding `epoch`, and
    /// `addr` must be `u64`-aligned and valid for the lifetime of the
    /// runtime.
    pub unsafe fn store(
        &self,
        seq: &EpochSequencer,
        pool_id: usize,
        epoch: u64,
        addr: usize,
        value: u64,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve(pool_id, addr)?;
        self.store_record(seq, epoch, record, value);
        Ok(())
    }

    /// Same as [`Self::store`], but against an already-resolved record
    /// (the fast-path callers in [`crate::driver`] cache this pointer
    /// across calls instead of re-probing the map every time).
    ///
    /// # Safety
    /// Same as [`Self::store`]; `record` must have come from this
    /// tracker's map.
    pub unsafe fn store_record(
        &self,
        seq: &EpochSequencer,
        epoch: u64,
        record: NonNull<Record>,
        value: u64,
    ) {
        debug_assert_eq!(
            record.as_ref().addr % std::mem::align_of::<u64>(),
            0,
            "unaligned address in dep_store"
        );
        let e_max = seq.e_max();
        let slot = (epoch % e_max as u64) as u32;

        self.touch_if_new(slot, record);

        let (read_bits_before, _write_bits_before) = record.as_ref().mark_write(slot, value);

        let dead = seq.rollback_bitmap() as u32;
        let mut bits = read_bits_before & !(1u32 << slot) & !dead;
        while bits != 0 {
            let i = ctz(bits);
            bits &= bits - 1;
            let reader_epoch = slot_to_epoch(epoch, slot, i, e_max);
            if epoch_lt(epoch, reader_epoch) {
                seq.do_rollback(reader_epoch);
            }
        }
    }

    /// Speculatively load `addr` under `epoch`, forwarding from the
    /// closest program-order-earlier buffered write if one exists,
    /// otherwise reading the committed value from shared memory. Fails
    /// with [`RuntimeError::OutOfMemory`] if resolving `addr` requires a
    /// fresh record allocation that the allocator can't satisfy.
    ///
    /// # Safety
    /// Must only be called by the worker currently holding `epoch`, and
    /// `addr` must be `u64`-aligned and valid for the lifetime of the
    /// runtime.
    pub unsafe fn load(
        &self,
        seq: &EpochSequencer,
        pool_id: usize,
        epoch: u64,
        addr: usize,
    ) -> Result<u64, RuntimeError> {
        let record = self.resolve(pool_id, addr)?;
        Ok(self.load_record(seq, epoch, record))
    }

    /// Same as [`Self::load`], but against an already-resolved record.
    ///
    /// # Safety
    /// Same as [`Self::load`]; `record` must have come from this
    /// tracker's map.
    pub unsafe fn load_record(&self, seq: &EpochSequencer, epoch: u64, record: NonNull<Record>) -> u64 {
        debug_assert_eq!(
            record.as_ref().addr % std::mem::align_of::<u64>(),
            0,
            "unaligned address in dep_load"
        );
        let e_max = seq.e_max();
        let slot = (epoch % e_max as u64) as u32;

        self.touch_if_new(slot, record);

        let (_read_bits_after, write_bits) = record.as_ref().mark_read(slot);

        let dead = seq.rollback_bitmap() as u32;
        let mut bits = write_bits & !(1u32 << slot) & !dead;
        let mut forward: Option<(u64, u32)> = None;
        while bits != 0 {
            let i = ctz(bits);
            bits &= bits - 1;
            let writer_epoch = slot_to_epoch(epoch, slot, i, e_max);
            if epoch_lt(writer_epoch, epoch)
                && forward.map_or(true, |(best, _)| epoch_lt(best, writer_epoch))
            {
                forward = Some((writer_epoch, i));
            }
        }

        // A forwarding candidate is only valid if it hasn't already been
        // committed out from under us: `last_commit` can outrun the bit
        // we just inspected when a concurrent commit publishes the value
        // and advances `last_commit` between our flag read and here, and
        // in that case the committed value in memory is the correct one
        // to return (the buffered copy may since have been overwritten
        // by the same slot's next occupant once the ring wraps).
        match forward {
            Some((writer_epoch, src_slot))
                if !epoch_le(writer_epoch, record.as_ref().last_commit()) =>
            {
                record.as_ref().buffered_write(src_slot)
            }
            _ => (*(record.as_ref().addr as *const AtomicU64)).load(Ordering::Acquire),
        }
    }

    /// Apply `epoch`'s buffered writes to shared memory and release its
    /// touched-record list.
    ///
    /// # Safety
    /// Must only be called once `epoch` is the oldest live epoch and
    /// has finished executing without being flagged for rollback.
    pub unsafe fn commit(&self, seq: &EpochSequencer, epoch: u64) {
        let slot = (epoch % seq.e_max() as u64) as u32;
        let mut cur = self.touched_heads.get(slot as usize) as *mut Record;
        while !cur.is_null() {
            let r = &*cur;
            if r.write_bits() & (1u32 << slot) != 0 {
                let _guard = r.commit_lock.lock();
                // Only publish if no newer epoch has already committed a
                // write to this address: the touched-record walk here is
                // per-epoch-slot, not necessarily in epoch order, and a
                // higher-numbered epoch that shares no ordering relation
                // with this commit call could have already run ahead
                // (e.g. after a rollback re-handed a lower epoch number).
                if epoch_lt(r.last_commit(), epoch) {
                    let value = r.buffered_write(slot);
                    (*(r.addr as *const AtomicU64)).store(value, Ordering::Release);
                    r.set_last_commit(epoch);
                }
            }
            let next = r.touched_next(slot);
            r.clear_slot(slot);
            cur = next;
        }
        self.touched_heads.set(slot as usize, 0);
    }

    /// Discard `epoch`'s buffered writes without applying them, and
    /// release its touched-record list. Always called by the worker
    /// that reclaims the epoch via `next_epoch` with `PriorStatus::Retry`
    /// — never by the epoch's original worker, which abandons it the
    /// moment `set_done` reports the rollback flag. `next_epoch`'s CAS
    /// on the `next` cursor hands exactly one worker that reclaim, so
    /// exactly one caller ever runs this for a given attempt.
    ///
    /// # Safety
    /// Must only be called by the worker that just reclaimed `epoch`
    /// with `PriorStatus::Retry`, before it re-runs the iteration.
    pub unsafe fn rollback(&self, seq: &EpochSequencer, epoch: u64) {
        let slot = (epoch % seq.e_max() as u64) as u32;
        let mut cur = self.touched_heads.get(slot as usize) as *mut Record;
        while !cur.is_null() {
            let r = &*cur;
            let next = r.touched_next(slot);
            r.clear_slot(slot);
            cur = next;
        }
        self.touched_heads.set(slot as usize, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::PriorStatus;

    #[test]
    fn store_then_load_same_epoch_sees_own_write() {
        let seq = EpochSequencer::new(4);
        let tracker = DependencyTracker::new(2, 4, 16);

        let cell = AtomicU64::new(0);
        let addr = &cell as *const AtomicU64 as usize;

        let (epoch, _) = seq.next_epoch().unwrap();
        unsafe {
            tracker.store(&seq, 0, epoch, addr, 42).unwrap();
            assert_eq!(tracker.load(&seq, 0, epoch, addr).unwrap(), 42);
        }
    }

    #[test]
    fn later_epoch_forwards_from_earlier_uncommitted_write() {
        let seq = EpochSequencer::new(4);
        let tracker = DependencyTracker::new(2, 4, 16);

        let cell = AtomicU64::new(0);
        let addr = &cell as *const AtomicU64 as usize;

        let (e0, _) = seq.next_epoch().unwrap();
        let (e1, _) = seq.next_epoch().unwrap();

        unsafe {
            tracker.store(&seq, 0, e0, addr, 7).unwrap();
            assert_eq!(tracker.load(&seq, 1, e1, addr).unwrap(), 7, "e1 forwards e0's buffered write");

            assert!(!seq.set_done(e0));
            assert_eq!(seq.next_commit(), Some((e0, ())));
            tracker.commit(&seq, e0);
            seq.commit_done(e0);
        }
        assert_eq!(cell.load(Ordering::Acquire), 7);
    }

    #[test]
    fn store_after_later_epoch_already_read_triggers_rollback() {
        let seq = EpochSequencer::new(4);
        let tracker = DependencyTracker::new(2, 4, 16);

        let cell = AtomicU64::new(0);
        let addr = &cell as *const AtomicU64 as usize;

        let (e0, _) = seq.next_epoch().unwrap();
        let (e1, _) = seq.next_epoch().unwrap();

        unsafe {
            // e1 reads stale (pre-write) value before e0 has stored.
            assert_eq!(tracker.load(&seq, 1, e1, addr).unwrap(), 0);
            // e0's store discovers e1 already read this address and
            // ran ahead of it in epoch order: violation.
            tracker.store(&seq, 0, e0, addr, 99).unwrap();
        }

        assert_ne!(seq.rollback_bitmap() & (1 << (e1 % 4)), 0);
        assert!(seq.set_done(e1), "e1 must have been flagged for rollback");
    }

    #[test]
    fn rollback_discards_buffered_writes() {
        let seq = EpochSequencer::new(4);
        let tracker = DependencyTracker::new(1, 4, 16);

        let cell = AtomicU64::new(5);
        let addr = &cell as *const AtomicU64 as usize;

        let (epoch, _) = seq.next_epoch().unwrap();
        unsafe {
            tracker.store(&seq, 0, epoch, addr, 123).unwrap();
            tracker.rollback(&seq, epoch);
        }
        assert_eq!(cell.load(Ordering::Acquire), 5, "rollback must not touch shared memory");
        assert_eq!(unsafe { tracker.touched_heads.get((epoch % 4) as usize) }, 0);
    }

    #[test]
    fn rolled_back_write_is_invisible_after_retry_and_commit() {
        let seq = EpochSequencer::new(4);
        let tracker = DependencyTracker::new(2, 4, 16);

        let cell = AtomicU64::new(1);
        let addr = &cell as *const AtomicU64 as usize;

        let (e0, _) = seq.next_epoch().unwrap();
        let (e1, _) = seq.next_epoch().unwrap();

        unsafe {
            // e1 reads the seed value before e0 (program-order earlier)
            // stores: e1 ran ahead and must be rolled back.
            assert_eq!(tracker.load(&seq, 1, e1, addr).unwrap(), 1);
            tracker.store(&seq, 0, e0, addr, 2).unwrap();
        }
        assert!(seq.set_done(e1));
        unsafe {
            tracker.rollback(&seq, e1);
        }
        seq.rollback_done(e1);

        let (re1, prior) = seq.next_epoch().unwrap();
        assert_eq!(re1, e1);
        assert_eq!(prior, PriorStatus::Retry);

        unsafe {
            assert!(!seq.set_done(e0));
            assert_eq!(seq.next_commit(), Some((e0, ())));
            tracker.commit(&seq, e0);
            seq.commit_done(e0);
            // A fresh read under the reissued epoch number must see e0's
            // value, not a ghost of the discarded attempt.
            assert_eq!(tracker.load(&seq, 1, re1, addr).unwrap(), 2);
        }
    }
}
