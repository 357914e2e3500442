//! # CinderDB - In-Memory OLTP Engine Core
//!
//! CinderDB is the transactional concurrency core of an in-memory,
//! NUMA-aware OLTP storage engine in the Silo lineage: many worker threads,
//! each pinned to a core, read and mutate shared record storage with
//! serializable isolation at commit-protocol speed and no central lock
//! manager.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cinderdb::{Engine, EngineConfig, IsolationLevel};
//!
//! let engine = Engine::start(EngineConfig::default())?;
//! let accounts = engine.create_array_storage(1, 1024, 16)?;
//!
//! let session = engine.impersonate(move |ctx: &mut cinderdb::TaskContext<'_>| {
//!     ctx.begin(IsolationLevel::Serializable)?;
//!     ctx.overwrite(&accounts, 42, &100u64.to_le_bytes(), 0)?;
//!     ctx.precommit()?;
//!     Ok(())
//! })?;
//! session.wait()?;
//! engine.shutdown()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           Engine (lifecycle root)         │
//! ├──────────────────┬───────────────────────┤
//! │   Worker Pool    │  Transaction Manager  │
//! │  (impersonation, │  (epoch ticker +      │
//! │   pinned loops)  │   commit protocol)    │
//! ├──────────────────┴───────────────────────┤
//! │     Log Records + Per-Worker Buffers      │
//! ├───────────────────────────────────────────┤
//! │   Records: owner TID word + payload       │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Every record embeds a packed 64-bit TID word that is simultaneously the
//! record's version, its lock, and the publication vehicle for commits.
//! A committing worker sorts its writes into the global (address) lock
//! order, locks them, re-verifies its reads, stamps a TID inside the
//! current epoch, and publishes payload plus TID with one release store per
//! record. Readers never lock: they take optimistic snapshots and let
//! commit-time verification catch interference.
//!
//! The global epoch advances on a ~20 ms tick and is the coarse unit of
//! serialization across workers; cross-worker TID comparison is epoch-first
//! with wrap-around semantics.
//!
//! ## Module Overview
//!
//! - [`engine`]: lifecycle root tying everything together
//! - [`epoch`]: the wrap-aware epoch and its clock
//! - [`txn`]: TID word, access sets, commit protocol
//! - [`storage`]: records and the flat-array storage exemplar
//! - [`log`]: log-record wire formats and per-worker buffers
//! - [`worker`]: pinned worker loops, impersonation, wait/wake
//!
//! Out of scope for the core: durability (log draining, snapshots),
//! recovery, page-organized storage variants, and the NUMA memory
//! allocator. The seams they plug into (log buffers, storage ids, worker
//! node groups) are all here.

#[macro_use]
mod macros;

pub mod config;
pub mod engine;
pub mod epoch;
pub mod log;
pub mod storage;
pub mod txn;
pub mod worker;

pub use engine::{Engine, EngineConfig};
pub use epoch::Epoch;
pub use log::{LogBuffer, OverwriteLog};
pub use storage::{ArrayStorage, Record, StorageId, StorageRegistry};
pub use txn::{
    AbortReason, CommitOutcome, CommitReceipt, IsolationLevel, TidCell, TidWord, TxnContext,
    TxnManager,
};
pub use worker::{Task, TaskContext, TaskSession, WorkerId, WorkerPool};
