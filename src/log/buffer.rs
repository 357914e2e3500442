//! # Per-Worker Log Buffer
//!
//! Every worker owns one private, append-only log buffer. The commit
//! protocol appends each applied log record here so a durability layer can
//! drain committed work per epoch; draining and flushing themselves are out
//! of scope.
//!
//! The buffer is strictly thread-local: no synchronization, no sharing.
//! Capacity is fixed at worker start-up so the hot commit path never
//! allocates; a commit reserves its total record length up front and only
//! then applies, which keeps "buffer full" out of the post-apply path.

use eyre::{ensure, Result};

use crate::config::LOG_ALIGNMENT;

use super::types::{LogHeader, LOG_HEADER_SIZE};

pub struct LogBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= LOG_HEADER_SIZE && capacity % LOG_ALIGNMENT == 0,
            "log buffer capacity {} must be a non-trivial multiple of {}",
            capacity,
            LOG_ALIGNMENT
        );
        Ok(Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Fails unless `bytes` more bytes fit. Commits call this before
    /// applying anything so appends afterwards cannot fail.
    pub fn ensure_remaining(&self, bytes: usize) -> Result<()> {
        ensure!(
            bytes <= self.remaining(),
            "log buffer full: {} of {} bytes used, {} more needed",
            self.buf.len(),
            self.capacity,
            bytes
        );
        Ok(())
    }

    /// Appends one complete log record image.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        ensure!(
            record.len() >= LOG_HEADER_SIZE && record.len() % LOG_ALIGNMENT == 0,
            "log record of {} bytes breaks buffer alignment",
            record.len()
        );
        self.ensure_remaining(record.len())?;
        self.buf.extend_from_slice(record);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Drops all buffered records, e.g. after the durability layer consumed
    /// them.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Iterates the buffered record images in append order.
    pub fn records(&self) -> LogRecordIter<'_> {
        LogRecordIter { bytes: &self.buf }
    }
}

pub struct LogRecordIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for LogRecordIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        use zerocopy::FromBytes;

        let (header, _) = LogHeader::read_from_prefix(self.bytes).ok()?;
        let length = header.log_length() as usize;
        if length < LOG_HEADER_SIZE || length > self.bytes.len() {
            return None;
        }
        let (record, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        Some(record)
    }
}
