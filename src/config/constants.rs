//! # CinderDB Configuration Constants
//!
//! This module centralizes the engine core's configuration constants,
//! grouping interdependent values together and documenting their
//! relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! EPOCH_BITS (28)
//!       │
//!       ├─> EPOCH_INT_OVERFLOW (derived: 1 << EPOCH_BITS)
//!       │     First epoch value that no longer fits the TID word.
//!       │
//!       └─> EPOCH_INT_HALF (derived: 1 << (EPOCH_BITS - 1))
//!             Wrap-around comparison window. Two epochs further apart
//!             than this are incomparable (programmer error).
//!
//! WORKERS_PER_NODE (256)
//!       │
//!       └─> Worker id layout: node = id >> 8, ordinal = id & 0xFF.
//!           MAX_NUMA_NODES * WORKERS_PER_NODE must fit the 16-bit
//!           thread-id field of the TID word.
//!
//! LOG_BUFFER_CAPACITY (1 MB)
//!       │
//!       └─> Must hold every log record of a single commit. The largest
//!           array-overwrite record is align8(24 + u16::MAX), so even a
//!           write set of inline-capacity size fits with a wide margin.
//! ```
//!
//! ## Timing Constants
//!
//! `EPOCH_TICK` is the nominal serialization granularity: committed work
//! becomes orderable across workers once per tick. `WORKER_TICK` only
//! bounds how late a worker notices a shutdown request; task hand-off is
//! signalled explicitly and never waits for the tick.

use std::time::Duration;

// ============================================================================
// EPOCH CONFIGURATION
// The epoch counter shares a 64-bit word with ordinal/thread/status bits,
// so its width is fixed by the TID layout
// ============================================================================

/// Width of the epoch field inside the TID word.
pub const EPOCH_BITS: u32 = 28;

/// First integer that does not fit the epoch field. Epoch values are always
/// strictly below this.
pub const EPOCH_INT_OVERFLOW: u32 = 1 << EPOCH_BITS;

/// Half of the epoch range. Wrap-aware comparison is defined only for
/// epochs closer than this.
pub const EPOCH_INT_HALF: u32 = 1 << (EPOCH_BITS - 1);

/// Interval at which the background ticker advances the global epoch.
pub const EPOCH_TICK: Duration = Duration::from_millis(20);

const _: () = assert!(EPOCH_BITS < 32, "epoch must leave room in a u32");

// ============================================================================
// WORKER CONFIGURATION
// ============================================================================

/// Workers per NUMA node. The worker id is `node << 8 | ordinal`, so this
/// is fixed by the id layout.
pub const WORKERS_PER_NODE: u16 = 256;

/// Maximum NUMA nodes addressable by the worker id layout.
pub const MAX_NUMA_NODES: u16 = 256;

/// Periodic tick of the worker wait/wake primitive. Workers re-check the
/// stop flag at least this often even if no wakeup arrives.
pub const WORKER_TICK: Duration = Duration::from_millis(100);

const _: () = assert!(
    (MAX_NUMA_NODES as u32) * (WORKERS_PER_NODE as u32) <= 1 << 16,
    "worker id layout must fit the 16-bit thread-id field of the TID word"
);

// ============================================================================
// TRANSACTION CONTEXT SIZING
// Inline capacities for the per-transaction access sets. Most OLTP
// transactions touch a handful of records; larger sets spill to the heap
// ============================================================================

/// Inline capacity of the read set.
pub const READ_SET_INLINE: usize = 16;

/// Inline capacity of the write set.
pub const WRITE_SET_INLINE: usize = 16;

// ============================================================================
// LOG BUFFER CONFIGURATION
// ============================================================================

/// Default capacity of each worker's private log buffer in bytes.
pub const LOG_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Alignment unit of every log record. Records are padded to this so a
/// filler record can always follow.
pub const LOG_ALIGNMENT: usize = 8;

const _: () = assert!(LOG_ALIGNMENT.is_power_of_two());

const _: () = assert!(
    LOG_BUFFER_CAPACITY % LOG_ALIGNMENT == 0,
    "log buffer capacity must preserve record alignment"
);
