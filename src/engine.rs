//! # Engine
//!
//! The lifecycle root that everything else hangs off: the transaction
//! manager (epoch clock + commit protocol), the storage table, and the
//! worker pool, brought up and torn down in dependency order. Workers
//! outlive tasks and the engine outlives workers, so all the back-pointers
//! inside the runtime reduce to ids into engine-owned tables.
//!
//! ```text
//! Engine::start                       Engine::shutdown
//! ─────────────                       ────────────────
//! 1. epoch ticker                     1. workers (stop, wake, join)
//! 2. worker pool                      2. epoch ticker
//! ```
//!
//! ## Submitting Work
//!
//! [`Engine::try_impersonate`] offers a task to the pool and reports
//! "all busy" as `None`; [`Engine::impersonate`] retries until a worker
//! accepts. The returned [`TaskSession`] is the only handle the client
//! needs: `session.wait()` blocks for the task's result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};
use tracing::info;

use crate::config::{EPOCH_TICK, LOG_BUFFER_CAPACITY};
use crate::epoch::Epoch;
use crate::storage::{ArrayStorage, StorageId, StorageRegistry};
use crate::txn::TxnManager;
use crate::worker::{Task, TaskSession, WorkerPool};
use crate::worker::pool::WorkerPoolConfig;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// NUMA node groups to create workers for.
    pub numa_nodes: u8,
    /// Workers per node, each pinned to its own core when `pin_workers`.
    pub workers_per_node: u8,
    /// Whether worker threads bind to cores. Off by default so tests and
    /// single-core environments behave.
    pub pin_workers: bool,
    /// Epoch ticker interval.
    pub epoch_tick: Duration,
    /// Capacity of each worker's private log buffer.
    pub log_buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            numa_nodes: 1,
            workers_per_node: 4,
            pin_workers: false,
            epoch_tick: EPOCH_TICK,
            log_buffer_capacity: LOG_BUFFER_CAPACITY,
        }
    }
}

pub struct Engine {
    manager: Arc<TxnManager>,
    storages: Arc<StorageRegistry>,
    pool: WorkerPool,
    running: AtomicBool,
}

impl Engine {
    /// Brings the engine up: epoch ticker first, then the workers (which
    /// spin until the ticker is initialized). Any failure tears down what
    /// already started.
    pub fn start(config: EngineConfig) -> Result<Engine> {
        let manager = TxnManager::with_epoch_tick(config.epoch_tick);
        manager.start()?;

        let storages = Arc::new(StorageRegistry::new());
        let pool_config = WorkerPoolConfig {
            numa_nodes: config.numa_nodes,
            workers_per_node: config.workers_per_node,
            log_buffer_capacity: config.log_buffer_capacity,
            pin_workers: config.pin_workers,
        };
        let pool = match WorkerPool::start(&pool_config, Arc::clone(&manager), Arc::clone(&storages))
        {
            Ok(pool) => pool,
            Err(err) => {
                let _ = manager.shutdown();
                return Err(err);
            }
        };

        info!(
            nodes = config.numa_nodes,
            workers_per_node = config.workers_per_node,
            "engine started"
        );
        Ok(Engine {
            manager,
            storages,
            pool,
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.manager
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The engine's current epoch; readable from outside, advanced only by
    /// the internal ticker.
    pub fn current_epoch(&self) -> Epoch {
        self.manager.current_epoch()
    }

    pub fn create_array_storage(
        &self,
        id: StorageId,
        array_size: u64,
        payload_size: u16,
    ) -> Result<Arc<ArrayStorage>> {
        ensure!(self.is_running(), "engine is shut down");
        self.storages.create_array(id, array_size, payload_size)
    }

    /// Offers `task` to the pool. `None` means every worker was busy; the
    /// submitter may retry or back off.
    pub fn try_impersonate(&self, task: impl Task) -> Result<Option<TaskSession>> {
        ensure!(self.is_running(), "engine is shut down");
        let session = TaskSession::new(task);
        if self.pool.try_impersonate(&session) {
            Ok(Some(session))
        } else {
            Ok(None)
        }
    }

    /// Submits `task`, yielding until a worker frees up.
    pub fn impersonate(&self, task: impl Task) -> Result<TaskSession> {
        ensure!(self.is_running(), "engine is shut down");
        let session = TaskSession::new(task);
        while !self.pool.try_impersonate(&session) {
            ensure!(self.is_running(), "engine shut down while waiting for a worker");
            std::thread::yield_now();
        }
        Ok(session)
    }

    /// Tears the engine down in reverse start order. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.shutdown()?;
        self.manager.shutdown()?;
        info!("engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
