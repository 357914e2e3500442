//! # Transactions
//!
//! Optimistic concurrency control at commit-protocol speed, with no central
//! lock manager. A transaction runs on one worker, recording the versions it
//! reads and buffering the mutations it intends as log records; the commit
//! protocol then sorts the write set into the global lock order, locks,
//! re-verifies every read, stamps a commit TID inside the current epoch, and
//! applies each log record as a single payload-write-plus-publish.
//!
//! - [`tid`]: the packed 64-bit TID word and its atomic cell
//! - [`access`]: per-transaction read/write sets
//! - [`manager`]: the epoch ticker and the commit protocol itself

pub mod access;
pub mod manager;
pub mod tid;

pub use access::TxnContext;
pub use manager::{AbortReason, CommitOutcome, CommitReceipt, TxnManager};
pub use tid::{TidCell, TidWord};

/// The level of isolation a transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// No read guarantees at all: the read set is not even recorded, so
    /// commits never fail read verification. Best throughput, no
    /// serializability.
    DirtyRead,
    /// Reads as of a recent snapshot. Until snapshot pages exist this is
    /// handled exactly like [`IsolationLevel::Serializable`].
    Snapshot,
    /// Full serializability: every read is re-verified at commit.
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Whether transactions at this level track their read set.
    pub fn records_reads(self) -> bool {
        !matches!(self, IsolationLevel::DirtyRead)
    }
}
