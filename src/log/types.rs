//! # Log Record Types
//!
//! This module defines the log-record wire format. Records are little-endian
//! `#[repr(C)]` zerocopy structs so the in-memory image is byte-for-byte the
//! buffer (and eventually on-disk) format.
//!
//! ## Common Header (8 bytes)
//!
//! ```text
//! +---------------+------------+------------+
//! | log_type_code | log_length | storage_id |
//! | (2 bytes)     | (2 bytes)  | (4 bytes)  |
//! +---------------+------------+------------+
//! ```
//!
//! ## Array-Overwrite Record
//!
//! The only modification operation of array storage: memcpy a byte range
//! into one record's payload.
//!
//! ```text
//! bytes  0..8   common header
//! bytes  8..16  array offset (u64)
//! bytes 16..20  in-epoch transaction order (u32, stamped at apply)
//! bytes 20..22  payload offset within the record (u16)
//! bytes 22..24  payload length (u16)
//! bytes 24..    payload, padded to align8
//! ```
//!
//! `log_length` is `align8(24 + payload_length)`; the padding guarantees a
//! filler record can always follow in a buffer.
//!
//! ## Apply Discipline
//!
//! [`OverwriteLog::apply_record`] runs inside the commit protocol with the
//! target record's key lock held and the commit TID fully generated (final
//! ordinal included, since the in-epoch order is copied from it). It writes
//! the payload, then publishes the commit TID into the owner word; that
//! single store is both the commit point and the unlock.

use std::sync::atomic::{fence, Ordering};

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::record::Record;
use crate::storage::StorageId;
use crate::txn::tid::TidWord;

use super::align8;

/// Log type code of the filler record.
pub const LOG_CODE_FILLER: u16 = 0x0001;
/// Log type code of the array-overwrite record.
pub const LOG_CODE_ARRAY_OVERWRITE: u16 = 0x0002;

/// Size of the common header in bytes.
pub const LOG_HEADER_SIZE: usize = 8;
/// Size of the array-overwrite record up to the inline payload.
pub const OVERWRITE_HEADER_SIZE: usize = 24;
/// Largest payload an overwrite record can carry while its length still
/// fits the 16-bit length field after alignment.
pub const MAX_OVERWRITE_PAYLOAD: usize = align8(u16::MAX as usize) - 8 - OVERWRITE_HEADER_SIZE;

/// The common prefix of every log record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct LogHeader {
    log_type_code: U16,
    log_length: U16,
    storage_id: U32,
}

impl LogHeader {
    wire_accessors! {
        log_type_code, set_log_type_code: u16 as U16;
        log_length, set_log_length: u16 as U16;
        storage_id, set_storage_id: u32 as U32;
    }

    pub fn new(log_type_code: u16, log_length: u16, storage_id: StorageId) -> Self {
        Self {
            log_type_code: U16::new(log_type_code),
            log_length: U16::new(log_length),
            storage_id: U32::new(storage_id),
        }
    }
}

const _: () = assert!(std::mem::size_of::<LogHeader>() == LOG_HEADER_SIZE);

/// Header of the array-overwrite record (everything before the payload).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct OverwriteHeader {
    header: LogHeader,
    array_offset: U64,
    xct_order: U32,
    payload_offset: U16,
    payload_count: U16,
}

impl OverwriteHeader {
    wire_accessors! {
        array_offset, set_array_offset: u64 as U64;
        xct_order, set_xct_order: u32 as U32;
        payload_offset, set_payload_offset: u16 as U16;
        payload_count, set_payload_count: u16 as U16;
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }
}

const _: () = assert!(std::mem::size_of::<OverwriteHeader>() == OVERWRITE_HEADER_SIZE);

/// An owned array-overwrite log record: the full wire image, header plus
/// inline payload plus alignment padding.
#[derive(Debug, Clone)]
pub struct OverwriteLog {
    bytes: SmallVec<[u8; 64]>,
}

impl OverwriteLog {
    /// Wire length of a record carrying `payload_count` payload bytes.
    pub fn calculate_log_length(payload_count: u16) -> u16 {
        align8(OVERWRITE_HEADER_SIZE + payload_count as usize) as u16
    }

    /// Builds a record that overwrites `payload.len()` bytes at
    /// `payload_offset` of the record at `array_offset`.
    ///
    /// The in-epoch order field stays zero until apply time.
    pub fn populate(
        storage_id: StorageId,
        array_offset: u64,
        payload: &[u8],
        payload_offset: u16,
    ) -> Result<Self> {
        ensure!(!payload.is_empty(), "overwrite payload must be non-empty");
        ensure!(
            payload.len() <= MAX_OVERWRITE_PAYLOAD,
            "overwrite payload of {} bytes exceeds the {}-byte record limit",
            payload.len(),
            MAX_OVERWRITE_PAYLOAD
        );

        let payload_count = payload.len() as u16;
        let log_length = Self::calculate_log_length(payload_count);
        let head = OverwriteHeader {
            header: LogHeader::new(LOG_CODE_ARRAY_OVERWRITE, log_length, storage_id),
            array_offset: U64::new(array_offset),
            xct_order: U32::new(0),
            payload_offset: U16::new(payload_offset),
            payload_count: U16::new(payload_count),
        };

        let mut bytes = SmallVec::with_capacity(log_length as usize);
        bytes.extend_from_slice(head.as_bytes());
        bytes.extend_from_slice(payload);
        bytes.resize(log_length as usize, 0);
        Ok(Self { bytes })
    }

    /// [`OverwriteLog::populate`] for a fixed-width value.
    pub fn populate_primitive<T: IntoBytes + Immutable>(
        storage_id: StorageId,
        array_offset: u64,
        value: T,
        payload_offset: u16,
    ) -> Result<Self> {
        Self::populate(storage_id, array_offset, value.as_bytes(), payload_offset)
    }

    /// Reconstructs a record from its wire image.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (head, _) = OverwriteHeader::read_from_prefix(bytes)
            .map_err(|_| eyre::eyre!("log record of {} bytes is too short", bytes.len()))?;
        if head.header().log_type_code() != LOG_CODE_ARRAY_OVERWRITE {
            bail!(
                "unexpected log type code {:#06x}",
                head.header().log_type_code()
            );
        }
        let expected = Self::calculate_log_length(head.payload_count());
        ensure!(
            head.header().log_length() == expected && bytes.len() == expected as usize,
            "log length {} does not match payload count {}",
            head.header().log_length(),
            head.payload_count()
        );
        Ok(Self {
            bytes: SmallVec::from_slice(bytes),
        })
    }

    fn head(&self) -> &OverwriteHeader {
        OverwriteHeader::ref_from_prefix(&self.bytes)
            .expect("record image always holds a full header")
            .0
    }

    fn head_mut(&mut self) -> &mut OverwriteHeader {
        OverwriteHeader::mut_from_prefix(&mut self.bytes)
            .expect("record image always holds a full header")
            .0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn log_length(&self) -> u16 {
        self.head().header().log_length()
    }

    pub fn storage_id(&self) -> StorageId {
        self.head().header().storage_id()
    }

    pub fn array_offset(&self) -> u64 {
        self.head().array_offset()
    }

    pub fn xct_order(&self) -> u32 {
        self.head().xct_order()
    }

    pub fn payload_offset(&self) -> u16 {
        self.head().payload_offset()
    }

    pub fn payload_count(&self) -> u16 {
        self.head().payload_count()
    }

    pub fn payload(&self) -> &[u8] {
        let count = self.payload_count() as usize;
        &self.bytes[OVERWRITE_HEADER_SIZE..OVERWRITE_HEADER_SIZE + count]
    }

    /// Applies this record to its target under the commit protocol.
    ///
    /// Preconditions: the caller holds `record`'s key lock, has verified the
    /// payload range, and `xct_id` is the final commit TID (its ordinal is
    /// copied into the in-epoch order field here).
    pub fn apply_record(&mut self, xct_id: TidWord, record: &Record) {
        self.apply_payload(xct_id, record);
        // The payload must be applied before the owner word unlocks.
        fence(Ordering::Release);
        debug_assert!(record.owner().load().before(xct_id));
        record.owner().publish(xct_id);
    }

    /// The payload-write half of [`OverwriteLog::apply_record`], without the
    /// publication. Used when several log records target the same record in
    /// one commit: only the last one publishes.
    pub(crate) fn apply_payload(&mut self, xct_id: TidWord, record: &Record) {
        debug_assert!(record.owner().load().is_keylocked());
        debug_assert!(
            self.payload_offset() as usize + self.payload_count() as usize
                <= record.payload_len()
        );

        self.head_mut().set_xct_order(xct_id.in_epoch_xct_order());
        record.write_payload(self.payload_offset() as usize, self.payload());
    }

    #[cfg(debug_assertions)]
    pub fn assert_valid(&self) {
        assert_eq!(self.head().header().log_type_code(), LOG_CODE_ARRAY_OVERWRITE);
        assert_eq!(
            self.head().header().log_length(),
            Self::calculate_log_length(self.payload_count())
        );
        assert_eq!(self.bytes.len(), self.log_length() as usize);
    }
}

/// A header-only record that fills otherwise-unused aligned space in a
/// buffer. Replay skips it.
pub struct FillerLog;

impl FillerLog {
    /// Writes a filler record covering all of `buf`.
    pub fn fill(buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() >= LOG_HEADER_SIZE && buf.len() % 8 == 0 && buf.len() <= u16::MAX as usize,
            "filler of {} bytes is not representable",
            buf.len()
        );
        let header = LogHeader::new(LOG_CODE_FILLER, buf.len() as u16, 0);
        buf[..LOG_HEADER_SIZE].copy_from_slice(header.as_bytes());
        buf[LOG_HEADER_SIZE..].fill(0);
        Ok(())
    }
}
