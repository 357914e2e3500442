//! # Array Storage
//!
//! The flat-array storage variant: a fixed-size array of fixed-size records
//! addressed by a `u64` offset. It is the simplest storage shape the engine
//! supports and the worked example for the log/commit machinery: the only
//! modification operation is overwriting a byte range of one record's
//! payload.
//!
//! ## Layout
//!
//! ```text
//! ArrayStorage (id = 7, payload_size = 16)
//! ┌─────────┬──────────────────────┐
//! │ offset 0│ owner TID │ 16 bytes │
//! ├─────────┼──────────────────────┤
//! │ offset 1│ owner TID │ 16 bytes │
//! ├─────────┼──────────────────────┤
//! │   ...   │          ...         │
//! └─────────┴──────────────────────┘
//! ```
//!
//! All records start with an invalid owner (before every transaction) and a
//! zeroed payload, so a freshly created array is fully readable without any
//! bootstrap commit.

use eyre::{ensure, Result};

use super::record::Record;
use super::StorageId;

/// Offset of a record within an array storage.
pub type ArrayOffset = u64;

pub struct ArrayStorage {
    id: StorageId,
    payload_size: u16,
    records: Box<[Record]>,
}

impl ArrayStorage {
    pub fn new(id: StorageId, array_size: u64, payload_size: u16) -> Result<Self> {
        ensure!(payload_size > 0, "array payload size must be non-zero");
        ensure!(array_size > 0, "array size must be non-zero");
        let records = (0..array_size)
            .map(|_| Record::new(payload_size as usize))
            .collect();
        Ok(Self {
            id,
            payload_size,
            records,
        })
    }

    #[inline]
    pub fn id(&self) -> StorageId {
        self.id
    }

    #[inline]
    pub fn payload_size(&self) -> u16 {
        self.payload_size
    }

    #[inline]
    pub fn array_size(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn record(&self, offset: ArrayOffset) -> Result<&Record> {
        ensure!(
            offset < self.array_size(),
            "offset {} out of bounds for array storage {} of size {}",
            offset,
            self.id,
            self.array_size()
        );
        Ok(&self.records[offset as usize])
    }
}

impl std::fmt::Debug for ArrayStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStorage")
            .field("id", &self.id)
            .field("payload_size", &self.payload_size)
            .field("array_size", &self.array_size())
            .finish()
    }
}
