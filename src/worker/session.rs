//! # Task Sessions (Impersonation)
//!
//! A session binds a submitted task to the worker that accepted it.
//! Submission is a single compare-and-swap on the worker's pending slot:
//! exactly one submitter wins an idle worker, everyone else sees "busy" and
//! picks a different worker. The winning session is bound to the worker,
//! which executes the task and fulfills the session's result slot.
//!
//! The session's result slot is the only handshake back to the client:
//! [`TaskSession::wait`] parks on it until the worker writes the outcome.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use super::runtime::TaskContext;
use super::WorkerId;

/// A unit of client work executed on a worker thread.
///
/// The context hands the task the worker's private transaction machinery;
/// everything shared (records, the epoch) is reached through it.
pub trait Task: Send + Sync + 'static {
    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<()>;
}

impl<F> Task for F
where
    F: Fn(&mut TaskContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self(ctx)
    }
}

const UNBOUND: u32 = u32::MAX;

/// Shared core of a session: the task plus the result slot. The worker's
/// pending slot holds one strong reference while the task is in flight.
pub(crate) struct SessionCore {
    task: Box<dyn Task>,
    worker: AtomicU32,
    result: Mutex<Option<Result<()>>>,
    fulfilled: Condvar,
}

impl SessionCore {
    fn new(task: Box<dyn Task>) -> Self {
        Self {
            task,
            worker: AtomicU32::new(UNBOUND),
            result: Mutex::new(None),
            fulfilled: Condvar::new(),
        }
    }

    pub(crate) fn run_task(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.task.run(ctx)
    }

    pub(crate) fn bind(&self, worker: WorkerId) {
        self.worker.store(u32::from(worker), Ordering::Release);
    }

    pub(crate) fn unbind(&self) {
        self.worker.store(UNBOUND, Ordering::Release);
    }

    fn bound_worker(&self) -> Option<WorkerId> {
        match self.worker.load(Ordering::Acquire) {
            UNBOUND => None,
            id => Some(id as WorkerId),
        }
    }

    /// Writes the task outcome and wakes the waiting client.
    pub(crate) fn fulfill(&self, result: Result<()>) {
        let mut slot = self.result.lock();
        debug_assert!(slot.is_none());
        *slot = Some(result);
        self.fulfilled.notify_all();
    }
}

/// Client-side handle for one submitted task.
pub struct TaskSession {
    core: Arc<SessionCore>,
}

impl TaskSession {
    pub fn new(task: impl Task) -> Self {
        Self::from_boxed(Box::new(task))
    }

    pub fn from_boxed(task: Box<dyn Task>) -> Self {
        Self {
            core: Arc::new(SessionCore::new(task)),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Whether a worker accepted this session.
    pub fn is_bound(&self) -> bool {
        self.core.bound_worker().is_some()
    }

    /// The worker executing this session, if any.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.core.bound_worker()
    }

    /// Blocks until the worker fulfills the result slot.
    pub fn wait(self) -> Result<()> {
        let mut slot = self.core.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.core.fulfilled.wait(&mut slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopTask;

    impl Task for NopTask {
        fn run(&self, _ctx: &mut TaskContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fresh_session_is_unbound() {
        let session = TaskSession::new(NopTask);
        assert!(!session.is_bound());
        assert_eq!(session.worker_id(), None);
    }

    #[test]
    fn bind_and_unbind_round_trip() {
        let session = TaskSession::new(NopTask);
        session.core().bind(0x0102);
        assert_eq!(session.worker_id(), Some(0x0102));
        session.core().unbind();
        assert!(!session.is_bound());
    }

    #[test]
    fn wait_returns_fulfilled_result() {
        let session = TaskSession::new(NopTask);
        let core = Arc::clone(session.core());
        let fulfiller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            core.fulfill(Err(eyre::eyre!("task failed")));
        });
        let result = session.wait();
        assert!(result.is_err());
        fulfiller.join().unwrap();
    }
}
