//! # Transaction Manager and Commit Protocol
//!
//! The transaction manager owns the global epoch ticker and implements the
//! commit protocol that grants serializability without any central lock
//! manager:
//!
//! ```text
//! precommit (read-write)
//! ──────────────────────
//! 0. reserve log-buffer space (fail cleanly before any lock is taken)
//! 1. sort the write set by record address      <- global lock order
//! 2. lock each write's key-lock bit            <- abort on a moved bit
//! 3. full fence, then sample the epoch E
//! 4. re-verify every read-set observation      <- abort on any change
//! 5. derive the commit TID inside E, strictly after every dependency
//! 6. apply each log record: payload write, release fence, publish TID
//!    (publication clears the key lock; no separate unlock store)
//! 7. append the stamped records to the worker's log buffer
//! ```
//!
//! Because every transaction locks in the same address order, no deadlock
//! cycle can form; locks are spin-acquired without timeouts. The abort path
//! releases held locks in reverse order and reports a transient
//! [`AbortReason`]; the caller retries from the beginning.
//!
//! ## Read-Only Fast Path
//!
//! A transaction with an empty write set never locks or fences: its commit
//! epoch is the largest epoch observed in its read set, and verification
//! only confirms the observations still hold.
//!
//! ## TID Generation
//!
//! The commit TID starts from `(E, last_ordinal + 1, thread_id)` and is
//! raised above every read-set owner and write-set snapshot via `store_max`.
//! A dependency can only tie the sampled epoch, never exceed it, so the
//! result always stays inside `E`, at an ordinal past every same-epoch
//! dependency.
//!
//! ## Epoch Ticker
//!
//! A background thread advances the epoch clock every
//! [`EPOCH_TICK`](crate::config::EPOCH_TICK) and is joined on shutdown.
//! Workers spin on [`TxnManager::is_initialized`] before processing.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::EPOCH_TICK;
use crate::epoch::{Epoch, EpochClock};
use crate::log::LogBuffer;
use crate::txn::access::TxnContext;
use crate::txn::tid::TidWord;
use crate::txn::IsolationLevel;
use crate::worker::waker::Waker;

/// Why a transaction had to abort. Both causes are transient: the caller
/// re-runs the transaction from its first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A read-set observation no longer holds: the record was overwritten
    /// or is locked by another committing transaction.
    ReadSetVerificationFailed,
    /// A write target carries the moved bit; it must be found again through
    /// a fresh lookup.
    RecordMoved,
}

/// What a successful commit looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// The serialization point of the transaction.
    pub epoch: Epoch,
    /// The published commit TID; `None` for read-only transactions, which
    /// publish nothing.
    pub tid: Option<TidWord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitReceipt),
    Aborted(AbortReason),
}

pub struct TxnManager {
    clock: EpochClock,
    ticker_waker: Waker,
    ticker: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl TxnManager {
    pub fn new() -> Arc<Self> {
        Self::with_epoch_tick(EPOCH_TICK)
    }

    pub fn with_epoch_tick(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock: EpochClock::new(),
            ticker_waker: Waker::new(tick),
            ticker: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Starts the epoch ticker. Workers refuse to process transactions
    /// until this has run.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut ticker = self.ticker.lock();
        ensure!(ticker.is_none(), "transaction manager already started");

        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("epoch-ticker".into())
            .spawn(move || {
                while !manager.ticker_waker.sleep() {
                    let epoch = manager.clock.advance();
                    debug!(epoch = epoch.value(), "advanced global epoch");
                }
            })
            .wrap_err("failed to spawn the epoch ticker thread")?;
        *ticker = Some(handle);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops and joins the epoch ticker. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        self.ticker_waker.request_stop();
        if let Some(handle) = self.ticker.lock().take() {
            handle
                .join()
                .map_err(|_| eyre!("epoch ticker thread panicked"))?;
        }
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn current_epoch(&self) -> Epoch {
        self.clock.current()
    }

    /// Advances the epoch immediately instead of waiting for the tick.
    pub fn advance_epoch(&self) -> Epoch {
        self.clock.advance()
    }

    /// Blocks until the clock moves past `epoch` or `timeout` elapses;
    /// returns the epoch current at return.
    pub fn wait_until_epoch_advanced(&self, epoch: Epoch, timeout: Duration) -> Epoch {
        self.clock.wait_until_advanced(epoch, timeout)
    }

    pub fn begin(&self, ctx: &mut TxnContext, isolation: IsolationLevel) -> Result<()> {
        ensure!(self.is_initialized(), "transaction manager is not running");
        ctx.activate(isolation)
    }

    /// Aborts the running transaction, dropping its access sets. The caller
    /// retries with a fresh [`TxnManager::begin`].
    pub fn abort(&self, ctx: &mut TxnContext) -> Result<()> {
        ensure!(ctx.is_active(), "no transaction to abort");
        ctx.deactivate();
        Ok(())
    }

    /// Runs the commit protocol on the accumulated access sets.
    ///
    /// `Ok(Aborted(_))` is the transient outcome: state is rolled back and
    /// nothing was published. `Err` is a lifecycle failure (e.g. the log
    /// buffer cannot hold the write set) and likewise publishes nothing.
    pub fn precommit(
        &self,
        ctx: &mut TxnContext,
        log_buffer: &mut LogBuffer,
    ) -> Result<CommitOutcome> {
        ensure!(ctx.is_active(), "no transaction to commit");

        let outcome = if ctx.write_set().is_empty() {
            self.precommit_readonly(ctx)
        } else {
            self.precommit_readwrite(ctx, log_buffer)?
        };
        ctx.deactivate();
        Ok(outcome)
    }

    fn precommit_readonly(&self, ctx: &TxnContext) -> CommitOutcome {
        let mut commit_epoch = Epoch::INVALID;
        for read in ctx.read_set() {
            let current = read.record().owner().load();
            if !current.equals_serial_order(read.observed())
                || current.is_keylocked()
                || current.is_moved()
            {
                return CommitOutcome::Aborted(AbortReason::ReadSetVerificationFailed);
            }
            commit_epoch.store_max(read.observed().epoch());
        }
        if !commit_epoch.is_valid() {
            commit_epoch = self.clock.current();
        }
        CommitOutcome::Committed(CommitReceipt {
            epoch: commit_epoch,
            tid: None,
        })
    }

    fn precommit_readwrite(
        &self,
        ctx: &mut TxnContext,
        log_buffer: &mut LogBuffer,
    ) -> Result<CommitOutcome> {
        // Phase 0: reserve buffer space while no lock is held yet.
        let total_log_bytes: usize = ctx
            .write_set()
            .iter()
            .map(|w| w.log().bytes().len())
            .sum();
        log_buffer
            .ensure_remaining(total_log_bytes)
            .wrap_err("write set exceeds the worker's log buffer")?;

        // Phase 1 + 2: sort into canonical order, then lock.
        ctx.sort_write_set();
        if !Self::lock_write_set(ctx) {
            return Ok(CommitOutcome::Aborted(AbortReason::RecordMoved));
        }

        // Phase 3: everything after this fence sees the locked state.
        fence(Ordering::SeqCst);
        let mut commit_epoch = self.clock.current();
        // A worker that used up the epoch's 64k ordinals closes the epoch
        // itself rather than waiting out the tick.
        if ctx.next_ordinal(commit_epoch).is_none() {
            commit_epoch = self.clock.advance();
        }

        // Phase 4: re-verify the read set.
        if !Self::verify_read_set(ctx) {
            Self::unlock_write_set(ctx);
            return Ok(CommitOutcome::Aborted(AbortReason::ReadSetVerificationFailed));
        }

        // Phase 5: commit TID, strictly after every observed dependency.
        let commit_tid = self.generate_commit_tid(ctx, commit_epoch);
        ctx.record_commit(commit_tid.epoch(), commit_tid.ordinal());

        // Phase 6 + 7: apply under lock, publish, and buffer the records.
        // Publication of the owner word doubles as the unlock, so after this
        // loop no lock is held. When several records target one record only
        // the last publishes; the earlier ones just stack their payloads.
        let write_set = ctx.write_set_mut();
        for index in 0..write_set.len() {
            let last_of_run = index + 1 == write_set.len()
                || write_set[index + 1].record_addr() != write_set[index].record_addr();
            let write = &mut write_set[index];
            // SAFETY: record() borrows from a storage pinned by the context.
            let record = unsafe { &*(write.record() as *const crate::storage::Record) };
            if last_of_run {
                write.log_mut().apply_record(commit_tid, record);
            } else {
                write.log_mut().apply_payload(commit_tid, record);
            }
        }
        for write in ctx.write_set() {
            log_buffer
                .append(write.log().bytes())
                .expect("space was reserved before locking");
        }

        Ok(CommitOutcome::Committed(CommitReceipt {
            epoch: commit_epoch,
            tid: Some(commit_tid),
        }))
    }

    /// Locks every write target in sorted order and refreshes each write's
    /// observed TID from the owner word it now holds locked; the staging
    /// snapshot may predate a commit that slipped in between. Returns
    /// `false` (with all acquired locks released) if a moved record was
    /// encountered.
    fn lock_write_set(ctx: &mut TxnContext) -> bool {
        let mut failed_at = None;
        let write_set = ctx.write_set_mut();
        for index in 0..write_set.len() {
            if index > 0 && write_set[index].record_addr() == write_set[index - 1].record_addr() {
                continue; // already self-locked
            }
            let observed = {
                let owner = write_set[index].record().owner();
                if !owner.keylock_fail_if_moved() {
                    failed_at = Some(index);
                    break;
                }
                let mut current = owner.load();
                current.clear_keylock();
                current
            };
            write_set[index].refresh_observed(observed);
        }
        match failed_at {
            Some(index) => {
                Self::unlock_prefix(ctx, index);
                false
            }
            None => true,
        }
    }

    fn unlock_write_set(ctx: &TxnContext) {
        Self::unlock_prefix(ctx, ctx.write_set().len());
    }

    /// Releases the locks of the first `count` (sorted) write entries in
    /// reverse order, skipping duplicate records.
    fn unlock_prefix(ctx: &TxnContext, count: usize) {
        let write_set = ctx.write_set();
        for index in (0..count).rev() {
            if index > 0 && write_set[index].record_addr() == write_set[index - 1].record_addr() {
                continue;
            }
            write_set[index].record().owner().release_keylock();
        }
    }

    /// Read validation: every observation must still hold, and a key-locked
    /// record is only acceptable when the lock is our own (the record is in
    /// the write set).
    fn verify_read_set(ctx: &TxnContext) -> bool {
        for read in ctx.read_set() {
            let current = read.record().owner().load();
            if !current.equals_serial_order(read.observed()) || current.is_moved() {
                return false;
            }
            if current.is_keylocked() && !Self::write_set_contains(ctx, read.record_addr()) {
                return false;
            }
        }
        true
    }

    fn write_set_contains(ctx: &TxnContext, record_addr: usize) -> bool {
        ctx.write_set()
            .binary_search_by_key(&record_addr, |w| w.record_addr())
            .is_ok()
    }

    fn generate_commit_tid(&self, ctx: &TxnContext, commit_epoch: Epoch) -> TidWord {
        let ordinal = ctx
            .next_ordinal(commit_epoch)
            .expect("ordinal space was ensured when the epoch was sampled");
        let seed = TidWord::clean(commit_epoch, ordinal, ctx.thread_id());
        let mut max_tid = seed;
        for read in ctx.read_set() {
            max_tid.store_max(read.observed());
        }
        for write in ctx.write_set() {
            max_tid.store_max(write.observed());
        }

        let commit_tid = if max_tid.equals_all(seed) {
            seed
        } else {
            // A same-epoch dependency outran the seed; step past it while
            // keeping our own thread identity. If the dependency sits at
            // the very last ordinal, the commit moves to a fresh epoch.
            debug_assert_eq!(max_tid.epoch(), commit_epoch);
            match max_tid.ordinal().checked_add(1) {
                Some(ordinal) => TidWord::clean(commit_epoch, ordinal, ctx.thread_id()),
                None => TidWord::clean(self.clock.advance(), 1, ctx.thread_id()),
            }
        };

        #[cfg(debug_assertions)]
        {
            for read in ctx.read_set() {
                debug_assert!(read.observed().before(commit_tid));
            }
            for write in ctx.write_set() {
                debug_assert!(write.observed().before(commit_tid));
            }
        }
        commit_tid
    }
}

impl Drop for TxnManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::types::OverwriteLog;
    use crate::storage::ArrayStorage;

    fn running_manager() -> Arc<TxnManager> {
        let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
        manager.start().unwrap();
        manager
    }

    fn storage() -> Arc<ArrayStorage> {
        Arc::new(ArrayStorage::new(7, 8, 8).unwrap())
    }

    fn overwrite(
        ctx: &mut TxnContext,
        storage: &Arc<ArrayStorage>,
        offset: u64,
        payload: &[u8],
        payload_offset: u16,
    ) {
        let record = storage.record(offset).unwrap();
        let observed = record.owner().spin_while_keylocked();
        let log = OverwriteLog::populate(storage.id(), offset, payload, payload_offset).unwrap();
        ctx.add_to_write_set(storage, record, observed, log);
    }

    #[test]
    fn begin_requires_running_manager() {
        let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
        let mut ctx = TxnContext::new(0);
        assert!(manager.begin(&mut ctx, IsolationLevel::Serializable).is_err());
        manager.start().unwrap();
        assert!(manager.begin(&mut ctx, IsolationLevel::Serializable).is_ok());
        manager.shutdown().unwrap();
    }

    #[test]
    fn single_writer_commit_publishes_payload_and_tid() {
        let manager = running_manager();
        let storage = storage();
        let mut ctx = TxnContext::new(0);
        let mut log_buffer = LogBuffer::new(1024).unwrap();

        for _ in 1..5 {
            manager.advance_epoch();
        }
        assert_eq!(manager.current_epoch(), Epoch::new(5));

        manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx, &storage, 0, &[0xAB, 0xCD], 3);
        let outcome = manager.precommit(&mut ctx, &mut log_buffer).unwrap();

        let receipt = match outcome {
            CommitOutcome::Committed(receipt) => receipt,
            CommitOutcome::Aborted(reason) => panic!("unexpected abort: {:?}", reason),
        };
        assert_eq!(receipt.epoch, Epoch::new(5));
        let tid = receipt.tid.unwrap();
        assert!(tid.equals_all(TidWord::clean(Epoch::new(5), 1, 0)));

        let record = storage.record(0).unwrap();
        assert!(record.owner().load().equals_all(tid));
        assert_eq!(
            record.payload_unsynchronized(),
            vec![0, 0, 0, 0xAB, 0xCD, 0, 0, 0]
        );

        let records: Vec<_> = log_buffer.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len(), 32);
        let logged = OverwriteLog::parse(records[0]).unwrap();
        assert_eq!(logged.xct_order(), tid.in_epoch_xct_order());
        manager.shutdown().unwrap();
    }

    #[test]
    fn read_set_change_aborts_and_retry_succeeds() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(4096).unwrap();

        // Transaction A observes record 0.
        let mut ctx_a = TxnContext::new(0);
        manager.begin(&mut ctx_a, IsolationLevel::Serializable).unwrap();
        let record = storage.record(0).unwrap();
        let mut buf = [0u8; 8];
        let tid0 = record.read_stable(&mut buf);
        ctx_a.add_to_read_set(&storage, record, tid0);
        overwrite(&mut ctx_a, &storage, 1, &[1], 0);

        // Transaction B commits a write to record 0 in between.
        let mut ctx_b = TxnContext::new(1);
        manager.begin(&mut ctx_b, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx_b, &storage, 0, &[9], 0);
        let tid1 = match manager.precommit(&mut ctx_b, &mut log_buffer).unwrap() {
            CommitOutcome::Committed(receipt) => receipt.tid.unwrap(),
            other => panic!("unexpected outcome: {:?}", other),
        };

        // A's validation must now fail.
        assert_eq!(
            manager.precommit(&mut ctx_a, &mut log_buffer).unwrap(),
            CommitOutcome::Aborted(AbortReason::ReadSetVerificationFailed)
        );
        assert!(!storage.record(1).unwrap().owner().load().is_valid());

        // Retry from the read: now sees tid1 and commits after it.
        manager.begin(&mut ctx_a, IsolationLevel::Serializable).unwrap();
        let observed = record.read_stable(&mut buf);
        assert!(observed.equals_all(tid1));
        ctx_a.add_to_read_set(&storage, record, observed);
        overwrite(&mut ctx_a, &storage, 1, &[1], 0);
        let tid2 = match manager.precommit(&mut ctx_a, &mut log_buffer).unwrap() {
            CommitOutcome::Committed(receipt) => receipt.tid.unwrap(),
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(tid1.before(tid2));
        manager.shutdown().unwrap();
    }

    #[test]
    fn moved_record_aborts_and_releases_prior_locks() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(1024).unwrap();

        storage.record(5).unwrap().owner().set_moved();

        let mut ctx = TxnContext::new(0);
        manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx, &storage, 2, &[1], 0);
        overwrite(&mut ctx, &storage, 5, &[2], 0);

        assert_eq!(
            manager.precommit(&mut ctx, &mut log_buffer).unwrap(),
            CommitOutcome::Aborted(AbortReason::RecordMoved)
        );
        // Every lock taken before the moved record was released again.
        assert!(!storage.record(2).unwrap().owner().load().is_keylocked());
        assert!(!storage.record(5).unwrap().owner().load().is_keylocked());
        assert!(log_buffer.is_empty());
        manager.shutdown().unwrap();
    }

    #[test]
    fn readonly_commit_uses_max_observed_epoch() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(1024).unwrap();

        // Commit a write in epoch 3.
        manager.advance_epoch();
        manager.advance_epoch();
        let mut writer = TxnContext::new(0);
        manager.begin(&mut writer, IsolationLevel::Serializable).unwrap();
        overwrite(&mut writer, &storage, 0, &[1], 0);
        manager.precommit(&mut writer, &mut log_buffer).unwrap();

        manager.advance_epoch();

        let mut reader = TxnContext::new(1);
        manager.begin(&mut reader, IsolationLevel::Serializable).unwrap();
        let record = storage.record(0).unwrap();
        let mut buf = [0u8; 8];
        let observed = record.read_stable(&mut buf);
        reader.add_to_read_set(&storage, record, observed);

        match manager.precommit(&mut reader, &mut log_buffer).unwrap() {
            CommitOutcome::Committed(receipt) => {
                assert_eq!(receipt.epoch, Epoch::new(3));
                assert_eq!(receipt.tid, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        manager.shutdown().unwrap();
    }

    #[test]
    fn commit_tid_steps_past_same_epoch_dependency() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(4096).unwrap();

        // Worker 0 commits twice on record 0, reaching ordinal 2.
        let mut ctx0 = TxnContext::new(0);
        let mut tid_first = TidWord::default();
        for fill in [1u8, 2] {
            manager.begin(&mut ctx0, IsolationLevel::Serializable).unwrap();
            overwrite(&mut ctx0, &storage, 0, &[fill], 0);
            tid_first = match manager.precommit(&mut ctx0, &mut log_buffer).unwrap() {
                CommitOutcome::Committed(receipt) => receipt.tid.unwrap(),
                other => panic!("unexpected outcome: {:?}", other),
            };
        }
        assert_eq!(tid_first.ordinal(), 2);

        // Worker 1 overwrites the same record in the same epoch: its own
        // ordinal would be 1, but the dependency forces it past ordinal 2.
        let mut ctx1 = TxnContext::new(1);
        manager.begin(&mut ctx1, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx1, &storage, 0, &[3], 0);
        let tid_second = match manager.precommit(&mut ctx1, &mut log_buffer).unwrap() {
            CommitOutcome::Committed(receipt) => receipt.tid.unwrap(),
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(tid_first.before(tid_second));
        assert_eq!(tid_second.ordinal(), tid_first.ordinal() + 1);
        assert_eq!(tid_second.thread_id(), 1);
        manager.shutdown().unwrap();
    }

    #[test]
    fn multiple_writes_to_one_record_apply_in_submission_order() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(4096).unwrap();

        let mut ctx = TxnContext::new(0);
        manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx, &storage, 3, &[0x11, 0x22], 0);
        overwrite(&mut ctx, &storage, 3, &[0x33], 1);
        let tid = match manager.precommit(&mut ctx, &mut log_buffer).unwrap() {
            CommitOutcome::Committed(receipt) => receipt.tid.unwrap(),
            other => panic!("unexpected outcome: {:?}", other),
        };

        let record = storage.record(3).unwrap();
        assert!(record.owner().load().equals_all(tid));
        assert_eq!(
            record.payload_unsynchronized(),
            vec![0x11, 0x33, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(log_buffer.records().count(), 2);
        manager.shutdown().unwrap();
    }

    #[test]
    fn full_log_buffer_fails_before_any_lock() {
        let manager = running_manager();
        let storage = storage();
        let mut log_buffer = LogBuffer::new(32).unwrap();

        let mut ctx = TxnContext::new(0);
        manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
        overwrite(&mut ctx, &storage, 0, &[1], 0);
        overwrite(&mut ctx, &storage, 1, &[2], 0);

        assert!(manager.precommit(&mut ctx, &mut log_buffer).is_err());
        assert!(!storage.record(0).unwrap().owner().load().is_keylocked());
        assert!(!storage.record(1).unwrap().owner().load().is_keylocked());
        manager.shutdown().unwrap();
    }
}
