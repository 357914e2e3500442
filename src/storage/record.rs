//! # Record
//!
//! A record is an owner TID word followed by opaque payload bytes. The owner
//! word is the sole per-record mutex and version container:
//!
//! - Acquiring its key-lock bit is the exclusive write permit.
//! - Publishing a new TID value (lock bit clear) commits the new payload and
//!   releases the lock in one store.
//! - Readers take an optimistic snapshot: wait for the lock bit to clear,
//!   copy the payload, and confirm the owner word did not change underneath.
//!
//! ## Why Atomic Payload Bytes
//!
//! A reader's payload copy can race with a writer's apply. The payload is
//! therefore stored as relaxed atomic bytes; the owner word's acquire/release
//! protocol supplies all ordering, and the re-validation loop discards any
//! torn copy. This keeps the optimistic read well-defined without claiming
//! more ordering per byte than the protocol needs.
//!
//! ## Snapshot Protocol
//!
//! ```text
//! reader                              writer (lock held)
//! ──────                              ──────────────────
//! v1 = owner (acquire, unlocked)      payload bytes (relaxed)
//! copy payload (relaxed)              release fence
//! acquire fence                       owner = commit TID (release)
//! v2 = owner
//! v1 == v2 ? snapshot good : retry
//! ```

use std::sync::atomic::{fence, AtomicU8, Ordering};

use crate::txn::tid::{TidCell, TidWord};

/// One shared record: embedded owner TID plus payload bytes.
pub struct Record {
    owner: TidCell,
    payload: Box<[AtomicU8]>,
}

impl Record {
    /// A fresh record with an invalid owner (before everything) and a
    /// zeroed payload.
    pub fn new(payload_len: usize) -> Self {
        let payload = (0..payload_len).map(|_| AtomicU8::new(0)).collect();
        Self {
            owner: TidCell::invalid(),
            payload,
        }
    }

    #[inline]
    pub fn owner(&self) -> &TidCell {
        &self.owner
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Takes a stable snapshot of the whole payload into `buf` and returns
    /// the owner word it is consistent with.
    ///
    /// The returned word never has the key-lock bit set. It may carry the
    /// delete bit; the record is then logically absent and the payload bytes
    /// are whatever the deleting transaction left behind.
    pub fn read_stable(&self, buf: &mut [u8]) -> TidWord {
        debug_assert_eq!(buf.len(), self.payload.len());
        loop {
            let observed = self.owner.spin_while_keylocked();
            for (dst, src) in buf.iter_mut().zip(self.payload.iter()) {
                *dst = src.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            let reread = self.owner.load();
            if observed.equals_all(reread) {
                return observed;
            }
            std::hint::spin_loop();
        }
    }

    /// Copies `src` into the payload at `offset`. Caller must hold the
    /// record's key lock; the bytes become visible to snapshot readers only
    /// once the caller publishes a new owner word.
    pub(crate) fn write_payload(&self, offset: usize, src: &[u8]) {
        debug_assert!(self.owner.load().is_keylocked());
        debug_assert!(offset + src.len() <= self.payload.len());
        for (dst, byte) in self.payload[offset..offset + src.len()].iter().zip(src) {
            dst.store(*byte, Ordering::Relaxed);
        }
    }

    /// Unsynchronized payload copy for single-threaded paths (storage
    /// construction, tests after all workers are quiesced).
    pub fn payload_unsynchronized(&self) -> Vec<u8> {
        self.payload
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed))
            .collect()
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("owner", &self.owner.load())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
