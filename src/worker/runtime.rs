//! # Worker Loop and Task Context
//!
//! Each worker is an OS thread pinned to a core, executing tasks handed to
//! it through a single-slot pending reference. The loop is:
//!
//! 1. Bind to the worker's core for the lifetime of the loop
//! 2. Spin until the transaction manager is initialized
//! 3. Park on the wait/wake handle
//! 4. On wake, drain the pending slot: run the task with the worker as
//!    context, clear the slot, fulfill the session, and loop in case a next
//!    task was queued immediately; an empty slot parks again
//!
//! A stop request observed between tasks ends the loop; tasks themselves are
//! never cancelled mid-flight.
//!
//! ## The Pending Slot
//!
//! Submitters race on a compare-and-swap from null to their session; only
//! one wins, the rest immediately see "busy". The worker reads the slot
//! without clearing it while the task runs (so the worker stays busy to
//! other submitters) and swaps it back to null right before fulfilling the
//! session.
//!
//! ## Task Context
//!
//! The worker's private transaction context and log buffer never leave its
//! thread. A task sees them only through [`TaskContext`], which also wires
//! in the shared pieces (epoch clock, commit protocol, storage table).

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use tracing::{debug, info};

use crate::epoch::Epoch;
use crate::log::types::OverwriteLog;
use crate::log::LogBuffer;
use crate::storage::{ArrayStorage, StorageRegistry};
use crate::txn::manager::CommitOutcome;
use crate::txn::tid::TidWord;
use crate::txn::{IsolationLevel, TxnContext, TxnManager};

use super::session::{SessionCore, TaskSession};
use super::waker::Waker;
use super::{numa_node_of, WorkerId};

/// The single-slot task handoff. Holds at most one strong session
/// reference, transferred in by a winning submitter CAS and taken out by
/// the worker after the task ran.
struct PendingSlot {
    ptr: AtomicPtr<SessionCore>,
}

impl PendingSlot {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Installs `core` if the slot is empty. On success the slot owns one
    /// strong reference until [`PendingSlot::clear`].
    fn try_set(&self, core: Arc<SessionCore>) -> bool {
        let raw = Arc::into_raw(core) as *mut SessionCore;
        match self.ptr.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: the CAS failed, so `raw` was never shared; we
                // reclaim the reference we just leaked.
                drop(unsafe { Arc::from_raw(raw) });
                false
            }
        }
    }

    fn peek(&self) -> *const SessionCore {
        self.ptr.load(Ordering::Acquire)
    }

    fn clear(&self) -> Option<Arc<SessionCore>> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: a non-null slot owns exactly one strong reference,
            // installed by try_set; we take it back.
            Some(unsafe { Arc::from_raw(raw) })
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.clear();
    }
}

/// The shared face of one worker: identity, pending slot, wait/wake handle.
/// The thread itself is owned by the pool.
pub struct WorkerHandle {
    id: WorkerId,
    pending: PendingSlot,
    waker: Waker,
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, waker: Waker) -> Self {
        Self {
            id,
            pending: PendingSlot::new(),
            waker,
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn numa_node(&self) -> u8 {
        numa_node_of(self.id)
    }

    /// Tries to claim this worker for the session's task.
    ///
    /// Exactly one of any number of concurrent submitters wins the CAS from
    /// null to task; the winner's session is bound to this worker and the
    /// worker is woken. Losing is not an error, merely "busy": pick another
    /// worker.
    pub fn try_impersonate(&self, session: &TaskSession) -> bool {
        session.core().bind(self.id);
        if self.pending.try_set(Arc::clone(session.core())) {
            self.waker.wakeup();
            true
        } else {
            session.core().unbind();
            false
        }
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn request_stop(&self) {
        self.waker.request_stop();
    }
}

/// What a running task sees of its worker: identity, the worker-private
/// transaction context and log buffer, and the engine-shared services.
pub struct TaskContext<'a> {
    worker_id: WorkerId,
    manager: &'a TxnManager,
    storages: &'a StorageRegistry,
    txn: &'a mut TxnContext,
    log_buffer: &'a mut LogBuffer,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        worker_id: WorkerId,
        manager: &'a TxnManager,
        storages: &'a StorageRegistry,
        txn: &'a mut TxnContext,
        log_buffer: &'a mut LogBuffer,
    ) -> Self {
        Self {
            worker_id,
            manager,
            storages,
            txn,
            log_buffer,
        }
    }

    #[inline]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    #[inline]
    pub fn numa_node(&self) -> u8 {
        numa_node_of(self.worker_id)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.manager.current_epoch()
    }

    pub fn storages(&self) -> &StorageRegistry {
        self.storages
    }

    pub fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.manager.begin(self.txn, isolation)
    }

    /// Reads the record at `offset` into `buf` (which must span the whole
    /// payload), recording the observed version for commit validation.
    ///
    /// The returned word may carry the delete bit: the record is then
    /// logically absent and `buf` holds residual bytes.
    pub fn read(
        &mut self,
        storage: &Arc<ArrayStorage>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<TidWord> {
        ensure!(self.txn.is_active(), "no transaction is running");
        ensure!(
            buf.len() == storage.payload_size() as usize,
            "read buffer of {} bytes does not match payload size {}",
            buf.len(),
            storage.payload_size()
        );
        let record = storage.record(offset)?;
        let observed = record.read_stable(buf);
        self.txn.add_to_read_set(storage, record, observed);
        Ok(observed)
    }

    /// Stages an overwrite of `payload.len()` bytes at `payload_offset` of
    /// the record at `offset`. Nothing is visible to anyone until commit.
    pub fn overwrite(
        &mut self,
        storage: &Arc<ArrayStorage>,
        offset: u64,
        payload: &[u8],
        payload_offset: u16,
    ) -> Result<()> {
        ensure!(self.txn.is_active(), "no transaction is running");
        ensure!(
            payload_offset as usize + payload.len() <= storage.payload_size() as usize,
            "overwrite of {} bytes at offset {} exceeds payload size {}",
            payload.len(),
            payload_offset,
            storage.payload_size()
        );
        let record = storage.record(offset)?;
        let observed = record.owner().spin_while_keylocked();
        let log = OverwriteLog::populate(storage.id(), offset, payload, payload_offset)?;
        self.txn.add_to_write_set(storage, record, observed, log);
        Ok(())
    }

    /// Runs the commit protocol on everything read and staged so far.
    pub fn precommit(&mut self) -> Result<CommitOutcome> {
        self.manager.precommit(self.txn, self.log_buffer)
    }

    /// Drops the current transaction's access sets without publishing.
    pub fn abort(&mut self) -> Result<()> {
        self.manager.abort(self.txn)
    }
}

/// Binds the calling thread to one core, derived from the worker id. Core
/// counts differ across machines, so the id wraps around the online CPUs.
#[cfg(target_os = "linux")]
fn bind_to_core(id: WorkerId) -> bool {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity only reads the set
    // and applies to the calling thread (pid 0).
    unsafe {
        let cpus = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        if cpus <= 0 {
            return false;
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(id as usize % cpus as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_core(_id: WorkerId) -> bool {
    false
}

/// The worker thread body. Owns the worker-private transaction context and
/// log buffer for the lifetime of the loop.
pub(crate) fn worker_main(
    handle: Arc<WorkerHandle>,
    manager: Arc<TxnManager>,
    storages: Arc<StorageRegistry>,
    mut log_buffer: LogBuffer,
    pin: bool,
) {
    let id = handle.id();
    let node = handle.numa_node();
    if pin {
        let pinned = bind_to_core(id);
        debug!(worker = id, node, pinned, "worker core binding");
    }
    info!(worker = id, node, "worker started");

    // Transaction processing cannot start before the manager is up.
    while !handle.waker().is_stop_requested() && !manager.is_initialized() {
        std::hint::spin_loop();
    }

    let mut txn = TxnContext::new(id);
    while !handle.waker().sleep() {
        // Keep draining in case a client queues the next task immediately.
        while !handle.waker().is_stop_requested() {
            let raw = handle.pending.peek();
            if raw.is_null() {
                break;
            }
            // SAFETY: the slot holds a strong reference until clear(), so
            // the core stays alive while we run the task through it.
            let core = unsafe { &*raw };
            debug!(worker = id, "worker picked up a task");
            let result = {
                let mut ctx = TaskContext::new(id, &manager, &storages, &mut txn, &mut log_buffer);
                core.run_task(&mut ctx)
            };
            // A task that errored out mid-transaction left the context
            // active; roll it back before accepting more work.
            if txn.is_active() {
                let _ = manager.abort(&mut txn);
            }
            let owned = handle
                .pending
                .clear()
                .expect("only the worker clears its pending slot");
            debug_assert!(ptr::eq(Arc::as_ptr(&owned), raw));
            owned.fulfill(result);
        }
    }
    // A task that won the slot after the stop request never ran; fail its
    // session instead of leaving the client parked forever.
    if let Some(core) = handle.pending.clear() {
        core.fulfill(Err(eyre!("worker {} stopped before running the task", id)));
    }
    info!(worker = id, node, "worker exits");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WORKER_TICK;

    struct NopTask;

    impl super::super::session::Task for NopTask {
        fn run(&self, _ctx: &mut TaskContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pending_slot_accepts_exactly_one() {
        let slot = PendingSlot::new();
        let first = TaskSession::new(NopTask);
        let second = TaskSession::new(NopTask);

        assert!(slot.try_set(Arc::clone(first.core())));
        assert!(!slot.try_set(Arc::clone(second.core())));
        assert!(!slot.peek().is_null());

        let taken = slot.clear().unwrap();
        assert!(Arc::ptr_eq(&taken, first.core()));
        assert!(slot.clear().is_none());
        assert!(slot.try_set(Arc::clone(second.core())));
    }

    #[test]
    fn try_impersonate_binds_winner_only() {
        let handle = WorkerHandle::new(0x0005, Waker::new(WORKER_TICK));
        let winner = TaskSession::new(NopTask);
        let loser = TaskSession::new(NopTask);

        assert!(handle.try_impersonate(&winner));
        assert_eq!(winner.worker_id(), Some(0x0005));
        assert!(!handle.try_impersonate(&loser));
        assert!(!loser.is_bound());
    }
}
