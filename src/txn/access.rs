//! # Transaction Access Sets
//!
//! The per-transaction context: the read set (record pointer + observed TID
//! snapshot per read) and the write set (record pointer + pre-write snapshot
//! + pending log record per write). Both sets are strictly thread-local;
//! they only ever touch shared state through the records they point at.
//!
//! ## Record Pointers and Lifetime
//!
//! Access entries hold raw record pointers, the same shape the commit
//! protocol consumes. Safety rests on one lifecycle rule: a record pointed
//! at by an active transaction must stay alive until that transaction
//! commits or aborts. The context enforces it by pinning an `Arc` to every
//! storage it touches for the duration of the transaction, so even a
//! storage dropped from the engine registry mid-transaction stays whole.
//!
//! ## Ordinal Bookkeeping
//!
//! The context remembers the epoch and ordinal of its last commit. The
//! commit protocol seeds the next TID from `(epoch, last_ordinal + 1)` when
//! the epoch is unchanged and restarts the ordinal on a fresh epoch.

use std::ptr::NonNull;
use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::{READ_SET_INLINE, WRITE_SET_INLINE};
use crate::epoch::Epoch;
use crate::log::types::OverwriteLog;
use crate::storage::{ArrayStorage, Record};
use crate::txn::tid::TidWord;
use crate::txn::IsolationLevel;

/// One observed read: which record, and the owner word it was consistent
/// with.
pub struct ReadAccess {
    record: NonNull<Record>,
    observed: TidWord,
}

impl ReadAccess {
    pub fn record(&self) -> &Record {
        // SAFETY: the context pins the owning storage until the transaction
        // finishes, so the record outlives this access entry.
        unsafe { self.record.as_ref() }
    }

    #[inline]
    pub fn observed(&self) -> TidWord {
        self.observed
    }

    #[inline]
    pub(crate) fn record_addr(&self) -> usize {
        self.record.as_ptr() as usize
    }
}

/// One pending mutation: which record, the owner word observed when the
/// write was staged, and the log record to apply at commit.
pub struct WriteAccess {
    record: NonNull<Record>,
    observed: TidWord,
    log: OverwriteLog,
}

impl WriteAccess {
    pub fn record(&self) -> &Record {
        // SAFETY: same pinning rule as ReadAccess.
        unsafe { self.record.as_ref() }
    }

    #[inline]
    pub fn observed(&self) -> TidWord {
        self.observed
    }

    pub fn log(&self) -> &OverwriteLog {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut OverwriteLog {
        &mut self.log
    }

    /// Replaces the staging-time snapshot with the owner observed under the
    /// key lock, so commit-TID generation dominates the actual dependency.
    pub(crate) fn refresh_observed(&mut self, observed: TidWord) {
        debug_assert!(!observed.is_keylocked());
        self.observed = observed;
    }

    #[inline]
    pub(crate) fn record_addr(&self) -> usize {
        self.record.as_ptr() as usize
    }
}

/// Per-worker transaction context. One lives on each worker thread and is
/// reused across transactions; it never leaves its thread.
pub struct TxnContext {
    thread_id: u16,
    isolation: IsolationLevel,
    active: bool,
    last_epoch: Epoch,
    last_ordinal: u16,
    read_set: SmallVec<[ReadAccess; READ_SET_INLINE]>,
    write_set: SmallVec<[WriteAccess; WRITE_SET_INLINE]>,
    pinned: SmallVec<[Arc<ArrayStorage>; 2]>,
}

impl TxnContext {
    pub fn new(thread_id: u16) -> Self {
        Self {
            thread_id,
            isolation: IsolationLevel::default(),
            active: false,
            last_epoch: Epoch::INVALID,
            last_ordinal: 0,
            read_set: SmallVec::new(),
            write_set: SmallVec::new(),
            pinned: SmallVec::new(),
        }
    }

    #[inline]
    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }

    #[inline]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn read_set(&self) -> &[ReadAccess] {
        &self.read_set
    }

    pub fn write_set(&self) -> &[WriteAccess] {
        &self.write_set
    }

    pub(crate) fn activate(&mut self, isolation: IsolationLevel) -> Result<()> {
        ensure!(!self.active, "a transaction is already running on this context");
        debug_assert!(self.read_set.is_empty() && self.write_set.is_empty());
        self.isolation = isolation;
        self.active = true;
        Ok(())
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.read_set.clear();
        self.write_set.clear();
        self.pinned.clear();
    }

    /// Records an observed read. At [`IsolationLevel::DirtyRead`] the
    /// observation is dropped, which exempts it from commit verification.
    pub fn add_to_read_set(
        &mut self,
        storage: &Arc<ArrayStorage>,
        record: &Record,
        observed: TidWord,
    ) {
        debug_assert!(self.active);
        if !self.isolation.records_reads() {
            return;
        }
        self.pin_storage(storage);
        self.read_set.push(ReadAccess {
            record: NonNull::from(record),
            observed,
        });
    }

    /// Stages an overwrite. `observed` is the pre-write owner snapshot; the
    /// commit TID is generated strictly after it.
    pub fn add_to_write_set(
        &mut self,
        storage: &Arc<ArrayStorage>,
        record: &Record,
        observed: TidWord,
        log: OverwriteLog,
    ) {
        debug_assert!(self.active);
        self.pin_storage(storage);
        self.write_set.push(WriteAccess {
            record: NonNull::from(record),
            observed,
            log,
        });
    }

    /// Orders the write set by record address: the system-wide canonical
    /// lock order. The sort is stable so multiple writes to one record keep
    /// their submission order.
    pub(crate) fn sort_write_set(&mut self) {
        self.write_set.sort_by_key(WriteAccess::record_addr);
    }

    pub(crate) fn write_set_mut(&mut self) -> &mut [WriteAccess] {
        &mut self.write_set
    }

    /// The ordinal the next commit TID would start from in `epoch`, or
    /// `None` when this context has exhausted the 64k ordinals an epoch
    /// offers (the committer then closes the epoch itself).
    pub(crate) fn next_ordinal(&self, epoch: Epoch) -> Option<u16> {
        if self.last_epoch == epoch {
            self.last_ordinal.checked_add(1)
        } else {
            Some(1)
        }
    }

    pub(crate) fn record_commit(&mut self, epoch: Epoch, ordinal: u16) {
        self.last_epoch = epoch;
        self.last_ordinal = ordinal;
    }

    fn pin_storage(&mut self, storage: &Arc<ArrayStorage>) {
        if !self.pinned.iter().any(|p| Arc::ptr_eq(p, storage)) {
            self.pinned.push(Arc::clone(storage));
        }
    }
}
