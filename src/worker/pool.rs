//! # Worker Pool
//!
//! The engine-scoped worker table: an array of worker handles addressed by
//! small integer ids, which sidesteps cyclic ownership between engine,
//! workers, and tasks. Worker ids encode their NUMA node in the high byte,
//! so consecutive ids within a node stay adjacent in the table.
//!
//! Start-up is all-or-nothing: every worker's log buffer is created first
//! (the fallible part), failures are aggregated into one error, and only
//! then are threads spawned. Shutdown stops every worker, wakes it, and
//! joins the threads, again aggregating failures.

use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::info;

use crate::config::WORKER_TICK;
use crate::log::LogBuffer;
use crate::storage::StorageRegistry;
use crate::txn::TxnManager;

use super::runtime::{worker_main, WorkerHandle};
use super::session::TaskSession;
use super::waker::Waker;
use super::compose_worker_id;

/// Shape of the pool: how many NUMA node groups and how many workers in
/// each, plus the per-worker resources.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub numa_nodes: u8,
    pub workers_per_node: u8,
    pub log_buffer_capacity: usize,
    pub pin_workers: bool,
}

pub struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    /// Brings up every worker or none: any per-worker initialization
    /// failure aborts the whole start after stopping what already runs.
    pub fn start(
        config: &WorkerPoolConfig,
        manager: Arc<TxnManager>,
        storages: Arc<StorageRegistry>,
    ) -> Result<Self> {
        let total = usize::from(config.numa_nodes) * usize::from(config.workers_per_node);
        if total == 0 {
            bail!("worker pool needs at least one worker");
        }

        // Create the fallible per-worker pieces first, aggregating failures.
        let mut buffers = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for node in 0..config.numa_nodes {
            for ordinal in 0..config.workers_per_node {
                match LogBuffer::new(config.log_buffer_capacity) {
                    Ok(buffer) => buffers.push(buffer),
                    Err(err) => failures.push(format!(
                        "worker {}: {:#}",
                        compose_worker_id(node, ordinal),
                        err
                    )),
                }
            }
        }
        if !failures.is_empty() {
            bail!("worker start-up failed: {}", failures.join("; "));
        }

        let mut pool = Self {
            workers: Vec::with_capacity(total),
            threads: Mutex::new(Vec::with_capacity(total)),
        };
        let mut buffers = buffers.into_iter();
        for node in 0..config.numa_nodes {
            for ordinal in 0..config.workers_per_node {
                let id = compose_worker_id(node, ordinal);
                let handle = Arc::new(WorkerHandle::new(id, Waker::new(WORKER_TICK)));
                let buffer = buffers.next().expect("one buffer per worker");
                let spawn = std::thread::Builder::new()
                    .name(format!("worker-{}-{}", node, ordinal))
                    .spawn({
                        let handle = Arc::clone(&handle);
                        let manager = Arc::clone(&manager);
                        let storages = Arc::clone(&storages);
                        let pin = config.pin_workers;
                        move || worker_main(handle, manager, storages, buffer, pin)
                    });
                match spawn {
                    Ok(thread) => {
                        pool.workers.push(handle);
                        pool.threads.lock().push(thread);
                    }
                    Err(err) => {
                        let _ = pool.shutdown();
                        return Err(err)
                            .wrap_err_with(|| format!("failed to spawn worker {}", id));
                    }
                }
            }
        }
        info!(workers = total, nodes = config.numa_nodes, "worker pool started");
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&Arc<WorkerHandle>> {
        self.workers.get(index)
    }

    /// Offers the session to each worker in turn until one accepts.
    /// `false` means every worker was busy; the submitter retries.
    pub fn try_impersonate(&self, session: &TaskSession) -> bool {
        self.workers
            .iter()
            .any(|worker| worker.try_impersonate(session))
    }

    /// Like [`WorkerPool::try_impersonate`] but restricted to one NUMA
    /// node's workers, for clients that want locality with their data.
    pub fn try_impersonate_on_node(&self, node: u8, session: &TaskSession) -> bool {
        self.workers
            .iter()
            .filter(|worker| worker.numa_node() == node)
            .any(|worker| worker.try_impersonate(session))
    }

    /// Stops and joins every worker. Tasks in flight finish first; pending
    /// slots left null are the termination signal.
    pub fn shutdown(&self) -> Result<()> {
        for worker in &self.workers {
            worker.request_stop();
        }
        let mut failures = Vec::new();
        for thread in self.threads.lock().drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            if thread.join().is_err() {
                failures.push(name);
            }
        }
        if !failures.is_empty() {
            return Err(eyre!("worker threads panicked: {}", failures.join(", ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            numa_nodes: 1,
            workers_per_node: 2,
            log_buffer_capacity: 4096,
            pin_workers: false,
        }
    }

    #[test]
    fn pool_starts_and_shuts_down() {
        let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
        manager.start().unwrap();
        let storages = Arc::new(StorageRegistry::new());

        let pool = WorkerPool::start(&test_config(), Arc::clone(&manager), storages).unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.worker(0).unwrap().id(), 0);
        assert_eq!(pool.worker(1).unwrap().id(), 1);

        pool.shutdown().unwrap();
        manager.shutdown().unwrap();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
        let storages = Arc::new(StorageRegistry::new());
        let config = WorkerPoolConfig {
            numa_nodes: 0,
            workers_per_node: 4,
            log_buffer_capacity: 4096,
            pin_workers: false,
        };
        assert!(WorkerPool::start(&config, manager, storages).is_err());
    }

    #[test]
    fn bad_log_buffer_capacity_fails_start() {
        let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
        let storages = Arc::new(StorageRegistry::new());
        let config = WorkerPoolConfig {
            numa_nodes: 1,
            workers_per_node: 2,
            log_buffer_capacity: 13,
            pin_workers: false,
        };
        let err = WorkerPool::start(&config, manager, storages).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("worker 0"));
        assert!(message.contains("worker 1"));
    }
}
