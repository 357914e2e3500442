//! # Transaction ID Word
//!
//! This module defines the packed 64-bit transaction identifier that doubles
//! as the per-record lock word and version container. Every record embeds one
//! TID as its *owner*; acquiring the key-lock bit of the owner is the
//! exclusive write permit, and publishing a new TID value commits the new
//! payload and releases the lock in a single store.
//!
//! ## Bit Layout (MSB first)
//!
//! ```text
//! ┌────────────┬───────────┬───────────┬───┬───┬───┬───┐
//! │ Epoch      │ Ordinal   │ Thread ID │ K │ R │ D │ M │
//! │ (28 bits)  │ (16 bits) │ (16 bits) │ 1 │ 1 │ 1 │ 1 │
//! └────────────┴───────────┴───────────┴───┴───┴───┴───┘
//!   K: key lock    - held during record mutation
//!   R: range lock  - protects the gap from this key to the next
//!   D: delete      - logical tombstone
//!   M: moved       - record migrated during a structural change
//! ```
//!
//! The upper 60 bits are the serialization order. Two TIDs compare epoch
//! first (wrap-aware), then by the full word as an unsigned integer. The
//! four status bits are masked off for serialization-order equality but a
//! full bitwise equality is also provided; the two relations are distinct.
//!
//! This layout is persisted verbatim inside each record, so it is also the
//! on-page format. Keep it in sync with the log-record wire format.
//!
//! ## Two Types
//!
//! - [`TidWord`]: a plain `Copy` value for snapshots, comparisons, and
//!   commit-TID generation. Never shared between threads by itself.
//! - [`TidCell`]: the shared atomic cell embedded in records. All lock
//!   traffic goes through it.
//!
//! ## Lock Protocol
//!
//! Writers must:
//! 1. Sort their write set by record address (global lock order)
//! 2. Acquire each key lock via CAS, spinning on contention
//! 3. Mutate the payload
//! 4. Publish the commit TID (release store, lock bit clear) - this is both
//!    the commit point and the unlock
//!
//! Readers never take the lock: they spin until the key-lock bit reads
//! clear and use the snapshot they observed, re-validating it at commit.
//!
//! ## Moved Bit
//!
//! Once set, the moved bit is never cleared. [`TidCell::keylock_fail_if_moved`]
//! refuses to lock such a record; the caller must abort and retry through a
//! fresh lookup. This is the only non-fatal lock failure.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::epoch::Epoch;

/// Bit masks and shifts of the TID word.
pub mod bits {
    //                                              0123456789abcdef
    pub const MASK_EPOCH: u64 = 0xFFFF_FFF0_0000_0000; // first 28 bits
    pub const MASK_ORDINAL: u64 = 0x0000_000F_FFF0_0000; // next 16 bits
    pub const MASK_THREAD_ID: u64 = 0x0000_0000_000F_FFF0; // next 16 bits
    /// The above three together: the serialization order.
    pub const MASK_SERIALIZER: u64 = 0xFFFF_FFFF_FFFF_FFF0;
    /// Ordinal and thread id: the in-epoch replay order stored in log records.
    pub const MASK_IN_EPOCH_ORDER: u64 = 0x0000_000F_FFFF_FFF0;

    pub const KEYLOCK_BIT: u64 = 0x8;
    pub const RANGELOCK_BIT: u64 = 0x4;
    pub const DELETE_BIT: u64 = 0x2;
    pub const MOVED_BIT: u64 = 0x1;
    pub const MASK_STATUS_BITS: u64 = 0xF;

    pub const SHIFT_EPOCH: u32 = 36;
    pub const SHIFT_ORDINAL: u32 = 20;
    pub const SHIFT_THREAD_ID: u32 = 4;
}

/// The 32-bit concatenation of ordinal and thread id, recorded in log
/// records for in-epoch replay ordering (epoch is implicit there).
pub type XctOrder = u32;

/// Extracts the ordinal half of an [`XctOrder`].
#[inline]
pub fn in_epoch_ordinal(order: XctOrder) -> u16 {
    (order >> 16) as u16
}

/// A packed transaction identifier. See the module docs for the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TidWord(u64);

impl TidWord {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        TidWord(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// A fully clean word: the given identity, all status bits zero.
    pub fn clean(epoch: Epoch, ordinal: u16, thread_id: u16) -> Self {
        debug_assert!(epoch.is_valid());
        TidWord(
            (u64::from(epoch.value()) << bits::SHIFT_EPOCH)
                | (u64::from(ordinal) << bits::SHIFT_ORDINAL)
                | (u64::from(thread_id) << bits::SHIFT_THREAD_ID),
        )
    }

    /// Replaces the entire word, zeroing status bits.
    pub fn set_clean(&mut self, epoch: Epoch, ordinal: u16, thread_id: u16) {
        *self = TidWord::clean(epoch, ordinal, thread_id);
    }

    #[inline]
    pub fn epoch(self) -> Epoch {
        Epoch::new(((self.0 & bits::MASK_EPOCH) >> bits::SHIFT_EPOCH) as u32)
    }

    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.0 = (self.0 & !bits::MASK_EPOCH) | (u64::from(epoch.value()) << bits::SHIFT_EPOCH);
    }

    #[inline]
    pub fn ordinal(self) -> u16 {
        ((self.0 & bits::MASK_ORDINAL) >> bits::SHIFT_ORDINAL) as u16
    }

    pub fn set_ordinal(&mut self, ordinal: u16) {
        self.0 =
            (self.0 & !bits::MASK_ORDINAL) | (u64::from(ordinal) << bits::SHIFT_ORDINAL);
    }

    #[inline]
    pub fn thread_id(self) -> u16 {
        ((self.0 & bits::MASK_THREAD_ID) >> bits::SHIFT_THREAD_ID) as u16
    }

    pub fn set_thread_id(&mut self, thread_id: u16) {
        self.0 =
            (self.0 & !bits::MASK_THREAD_ID) | (u64::from(thread_id) << bits::SHIFT_THREAD_ID);
    }

    /// A word is valid once it carries a valid (non-zero) epoch.
    #[inline]
    pub fn is_valid(self) -> bool {
        (self.0 & bits::MASK_EPOCH) != 0
    }

    /// The serial order within the epoch: `(ordinal << 16) | thread_id`.
    #[inline]
    pub fn in_epoch_xct_order(self) -> XctOrder {
        ((self.0 & bits::MASK_IN_EPOCH_ORDER) >> bits::SHIFT_THREAD_ID) as XctOrder
    }

    /// Status-bit-insensitive equality of the serialization order.
    #[inline]
    pub fn equals_serial_order(self, other: TidWord) -> bool {
        (self.0 & bits::MASK_SERIALIZER) == (other.0 & bits::MASK_SERIALIZER)
    }

    /// Full bitwise equality, status bits included.
    #[inline]
    pub fn equals_all(self, other: TidWord) -> bool {
        self.0 == other.0
    }

    /// Whether `self` is strictly before `other` in serialization order.
    ///
    /// An invalid word is before everything. Epochs are compared wrap-aware;
    /// on an epoch tie the full word decides as an unsigned integer.
    /// `other` must be valid.
    pub fn before(self, other: TidWord) -> bool {
        debug_assert!(other.is_valid());
        if self.epoch().before(other.epoch()) {
            true
        } else {
            self.0 < other.0
        }
    }

    /// Copies `other` if it is valid and strictly after `self`.
    ///
    /// Used during commit to derive a TID later than every observed
    /// dependency. Like [`TidWord::before`], this cannot distinguish two
    /// words that differ only in status bits, which is fine for that use.
    pub fn store_max(&mut self, other: TidWord) {
        if other.is_valid() && self.before(other) {
            self.0 = other.0;
        }
    }

    #[inline]
    pub fn is_keylocked(self) -> bool {
        (self.0 & bits::KEYLOCK_BIT) != 0
    }

    #[inline]
    pub fn is_rangelocked(self) -> bool {
        (self.0 & bits::RANGELOCK_BIT) != 0
    }

    #[inline]
    pub fn is_deleted(self) -> bool {
        (self.0 & bits::DELETE_BIT) != 0
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        (self.0 & bits::MOVED_BIT) != 0
    }

    #[inline]
    pub fn is_status_bits_off(self) -> bool {
        (self.0 & bits::MASK_STATUS_BITS) == 0
    }

    pub fn clear_keylock(&mut self) {
        self.0 &= !bits::KEYLOCK_BIT;
    }

    pub fn set_deleted(&mut self) {
        self.0 |= bits::DELETE_BIT;
    }

    pub fn clear_deleted(&mut self) {
        self.0 &= !bits::DELETE_BIT;
    }

    pub fn set_moved(&mut self) {
        self.0 |= bits::MOVED_BIT;
    }

    pub fn clear_status_bits(&mut self) {
        self.0 &= !bits::MASK_STATUS_BITS;
    }
}

/// The shared atomic TID cell embedded in every record as its owner word.
///
/// This is the sole per-record synchronization point: lock, version check,
/// and commit publication all go through this one word.
#[derive(Debug)]
pub struct TidCell(AtomicU64);

impl TidCell {
    pub fn new(initial: TidWord) -> Self {
        TidCell(AtomicU64::new(initial.raw()))
    }

    /// Invalid owner: the record has never been committed to.
    pub fn invalid() -> Self {
        TidCell(AtomicU64::new(0))
    }

    /// Acquire-fenced snapshot of the word.
    #[inline]
    pub fn load(&self) -> TidWord {
        TidWord(self.0.load(Ordering::Acquire))
    }

    /// Plain store for single-threaded setup paths. Not for shared cells.
    pub fn set(&self, word: TidWord) {
        self.0.store(word.raw(), Ordering::Relaxed);
    }

    /// Locks the key, busy-waiting if already locked.
    ///
    /// No timeout: progress relies on the canonical lock ordering that the
    /// commit protocol imposes, which makes deadlock impossible. This
    /// variant does not look at the moved bit; callers must know the record
    /// cannot move underneath them.
    pub fn keylock_unconditional(&self) {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            if cur & bits::KEYLOCK_BIT != 0 {
                fence(Ordering::Acquire);
                std::hint::spin_loop();
                continue;
            }
            let desired = cur | bits::KEYLOCK_BIT;
            if self
                .0
                .compare_exchange_weak(cur, desired, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert!(self.load().is_keylocked());
                return;
            }
        }
    }

    /// Same as [`TidCell::keylock_unconditional`] except that any
    /// observation of the moved bit returns `false` without acquiring.
    ///
    /// The record was relocated by a concurrent structural change; the
    /// transaction must abort and retry from a fresh lookup.
    pub fn keylock_fail_if_moved(&self) -> bool {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            if cur & bits::MOVED_BIT != 0 {
                return false;
            }
            if cur & bits::KEYLOCK_BIT != 0 {
                fence(Ordering::Acquire);
                std::hint::spin_loop();
                continue;
            }
            let desired = cur | bits::KEYLOCK_BIT;
            if self
                .0
                .compare_exchange_weak(cur, desired, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert!(self.load().is_keylocked());
                return true;
            }
        }
    }

    /// Acquires every cell in order.
    ///
    /// Semantically identical to calling [`TidCell::keylock_unconditional`]
    /// on each cell in turn. A platform with a 16-byte CAS may fuse two
    /// adjacent words into one acquisition; fusing consecutive entries is
    /// always safe because the caller's canonical order is total. Rust
    /// stable offers no 128-bit compare-exchange, so this is currently the
    /// sequential path with the batch signature kept for that upgrade.
    pub fn keylock_unconditional_batch(cells: &[&TidCell]) {
        for cell in cells {
            cell.keylock_unconditional();
        }
    }

    /// Returns a snapshot taken after the key-lock bit was observed clear.
    ///
    /// The acquire ordering pairs with the holder's release publication, so
    /// the payload read after this call reflects exactly the commit that
    /// produced the returned word.
    pub fn spin_while_keylocked(&self) -> TidWord {
        loop {
            let copied = self.0.load(Ordering::Acquire);
            if copied & bits::KEYLOCK_BIT == 0 {
                return TidWord(copied);
            }
            std::hint::spin_loop();
        }
    }

    /// Clears the key-lock bit without changing the rest of the word.
    ///
    /// Lock-holder privilege: nobody else may touch the word while the bit
    /// is set, so a load-modify-store without CAS is race-free. Used on the
    /// abort path; successful commits release through [`TidCell::publish`].
    pub fn release_keylock(&self) {
        let cur = self.0.load(Ordering::Relaxed);
        debug_assert!(cur & bits::KEYLOCK_BIT != 0);
        self.0.store(cur & !bits::KEYLOCK_BIT, Ordering::Release);
    }

    /// Publishes a new owner word, committing the payload written under the
    /// lock and releasing it in a single store.
    ///
    /// Preconditions: the caller holds the key lock, `word` has the
    /// key-lock bit clear, and the caller issued (or relies on this store's
    /// release ordering for) the payload-before-publication fence.
    pub fn publish(&self, word: TidWord) {
        debug_assert!(self.0.load(Ordering::Relaxed) & bits::KEYLOCK_BIT != 0);
        debug_assert!(!word.is_keylocked());
        self.0.store(word.raw(), Ordering::Release);
    }

    /// Locks the range bit, busy-waiting if already locked.
    pub fn rangelock_unconditional(&self) {
        loop {
            let cur = self.0.load(Ordering::Relaxed) & !bits::RANGELOCK_BIT;
            let desired = cur | bits::RANGELOCK_BIT;
            if self
                .0
                .compare_exchange_weak(cur, desired, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert!(self.load().is_rangelocked());
                return;
            }
            fence(Ordering::Acquire);
            std::hint::spin_loop();
        }
    }

    pub fn spin_while_rangelocked(&self) -> TidWord {
        loop {
            let copied = self.0.load(Ordering::Acquire);
            if copied & bits::RANGELOCK_BIT == 0 {
                return TidWord(copied);
            }
            std::hint::spin_loop();
        }
    }

    pub fn release_rangelock(&self) {
        let cur = self.0.load(Ordering::Relaxed);
        debug_assert!(cur & bits::RANGELOCK_BIT != 0);
        self.0.store(cur & !bits::RANGELOCK_BIT, Ordering::Release);
    }

    /// Sets the logical tombstone. Caller must hold the key lock.
    pub fn set_deleted(&self) {
        debug_assert!(self.load().is_keylocked());
        self.0.fetch_or(bits::DELETE_BIT, Ordering::AcqRel);
    }

    /// Marks the record as migrated. Once set, never cleared.
    pub fn set_moved(&self) {
        self.0.fetch_or(bits::MOVED_BIT, Ordering::AcqRel);
    }

    /// Takes the key lock without an atomic RMW. Only allowed when there is
    /// no possible race, e.g. while building a storage before it is shared.
    pub fn initial_lock(&self) {
        let cur = self.0.load(Ordering::Relaxed);
        debug_assert!(cur & bits::KEYLOCK_BIT == 0);
        self.0.store(cur | bits::KEYLOCK_BIT, Ordering::Relaxed);
    }

    /// Non-atomic counterpart of [`TidCell::initial_lock`].
    pub fn initial_unlock(&self) {
        let cur = self.0.load(Ordering::Relaxed);
        debug_assert!(cur & bits::KEYLOCK_BIT != 0);
        self.0.store(cur & !bits::KEYLOCK_BIT, Ordering::Relaxed);
    }
}

/// Releases a held key lock on drop. Abort-path convenience; commits
/// release through [`TidCell::publish`] instead.
pub struct KeylockGuard<'a> {
    cell: &'a TidCell,
}

impl<'a> KeylockGuard<'a> {
    /// Wraps an already-acquired lock.
    pub fn adopt(cell: &'a TidCell) -> Self {
        debug_assert!(cell.load().is_keylocked());
        KeylockGuard { cell }
    }

    /// Hands the lock back to manual management without releasing it.
    pub fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for KeylockGuard<'_> {
    fn drop(&mut self) {
        self.cell.release_keylock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tid(epoch: u32, ordinal: u16, thread: u16) -> TidWord {
        TidWord::clean(Epoch::new(epoch), ordinal, thread)
    }

    #[test]
    fn tid_word_is_64_bits() {
        assert_eq!(std::mem::size_of::<TidWord>(), 8);
        assert_eq!(std::mem::size_of::<TidCell>(), 8);
    }

    #[test]
    fn clean_word_round_trips_fields() {
        let t = tid(0x0ABCDEF, 0x1234, 0x5678);
        assert_eq!(t.epoch(), Epoch::new(0x0ABCDEF));
        assert_eq!(t.ordinal(), 0x1234);
        assert_eq!(t.thread_id(), 0x5678);
        assert!(t.is_status_bits_off());
        assert!(t.is_valid());
    }

    #[test]
    fn field_setters_do_not_disturb_neighbors() {
        let mut t = tid(7, 1, 2);
        t.set_ordinal(0xFFFF);
        assert_eq!(t.epoch(), Epoch::new(7));
        assert_eq!(t.thread_id(), 2);
        t.set_thread_id(0xFFFF);
        assert_eq!(t.ordinal(), 0xFFFF);
        t.set_epoch(Epoch::new(9));
        assert_eq!(t.ordinal(), 0xFFFF);
        assert_eq!(t.thread_id(), 0xFFFF);
        assert_eq!(t.epoch(), Epoch::new(9));
    }

    #[test]
    fn invalid_word_is_before_every_valid_word() {
        let invalid = TidWord::default();
        assert!(!invalid.is_valid());
        assert!(invalid.before(tid(1, 0, 0)));
    }

    #[test]
    fn before_orders_epoch_then_word() {
        assert!(tid(4, 9, 9).before(tid(5, 0, 0)));
        assert!(tid(5, 1, 0).before(tid(5, 2, 0)));
        assert!(tid(5, 1, 3).before(tid(5, 1, 4)));
        assert!(!tid(5, 1, 4).before(tid(5, 1, 4)));
        assert!(!tid(6, 0, 0).before(tid(5, 9, 9)));
    }

    #[test]
    fn serial_order_equality_masks_status_bits() {
        let a = tid(3, 4, 5);
        let mut b = a;
        b.set_deleted();
        b.set_moved();
        assert!(a.equals_serial_order(b));
        assert!(!a.equals_all(b));
        assert!(a.equals_all(a));
    }

    #[test]
    fn store_max_takes_later_dependency() {
        let mut t = tid(5, 2, 0);
        t.store_max(tid(5, 1, 0));
        assert_eq!(t, tid(5, 2, 0));
        t.store_max(tid(5, 7, 3));
        assert_eq!(t, tid(5, 7, 3));
        t.store_max(TidWord::default());
        assert_eq!(t, tid(5, 7, 3));
    }

    #[test]
    fn in_epoch_order_concatenates_ordinal_and_thread() {
        let t = tid(1, 0xAB, 0xCD);
        assert_eq!(t.in_epoch_xct_order(), 0x00AB_00CD);
        assert_eq!(in_epoch_ordinal(t.in_epoch_xct_order()), 0xAB);
    }

    #[test]
    fn keylock_and_release() {
        let cell = TidCell::new(tid(2, 1, 0));
        cell.keylock_unconditional();
        assert!(cell.load().is_keylocked());
        cell.release_keylock();
        assert!(!cell.load().is_keylocked());
        assert_eq!(cell.load(), tid(2, 1, 0));
    }

    #[test]
    fn keylock_fail_if_moved_refuses_moved_record() {
        let cell = TidCell::new(tid(2, 1, 0));
        cell.set_moved();
        assert!(!cell.keylock_fail_if_moved());
        assert!(!cell.load().is_keylocked());

        let clean = TidCell::new(tid(2, 1, 0));
        assert!(clean.keylock_fail_if_moved());
        assert!(clean.load().is_keylocked());
    }

    #[test]
    fn publish_replaces_word_and_unlocks() {
        let cell = TidCell::new(tid(2, 1, 0));
        cell.keylock_unconditional();
        cell.publish(tid(3, 1, 0));
        let owner = cell.load();
        assert!(!owner.is_keylocked());
        assert!(owner.equals_all(tid(3, 1, 0)));
    }

    #[test]
    fn batch_lock_matches_sequential_acquires() {
        let a = TidCell::new(tid(1, 1, 0));
        let b = TidCell::new(tid(1, 2, 0));
        TidCell::keylock_unconditional_batch(&[&a, &b]);
        assert!(a.load().is_keylocked());
        assert!(b.load().is_keylocked());
        a.release_keylock();
        b.release_keylock();

        let c = TidCell::new(tid(1, 1, 0));
        let d = TidCell::new(tid(1, 2, 0));
        c.keylock_unconditional();
        d.keylock_unconditional();
        assert_eq!(a.load().raw(), c.load().raw());
        assert_eq!(b.load().raw(), d.load().raw());
    }

    #[test]
    fn rangelock_round_trip() {
        let cell = TidCell::new(tid(1, 1, 0));
        cell.rangelock_unconditional();
        assert!(cell.load().is_rangelocked());
        cell.release_rangelock();
        assert!(!cell.load().is_rangelocked());
    }

    #[test]
    fn guard_releases_on_drop() {
        let cell = TidCell::new(tid(1, 1, 0));
        cell.keylock_unconditional();
        {
            let _guard = KeylockGuard::adopt(&cell);
        }
        assert!(!cell.load().is_keylocked());
    }

    #[test]
    fn spin_while_keylocked_waits_for_holder() {
        let cell = Arc::new(TidCell::new(tid(1, 1, 0)));
        cell.keylock_unconditional();

        let reader = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.spin_while_keylocked())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        cell.publish(tid(2, 1, 0));

        let snapshot = reader.join().unwrap();
        assert!(!snapshot.is_keylocked());
        assert!(snapshot.equals_serial_order(tid(2, 1, 0)));
    }

    #[test]
    fn contended_lock_is_exclusive() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;

        let cell = Arc::new(TidCell::new(tid(1, 0, 0)));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let cell = Arc::clone(&cell);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    cell.keylock_unconditional();
                    let seen = counter.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(counter.load(Ordering::Relaxed), seen + 1);
                    counter.fetch_sub(1, Ordering::Relaxed);
                    cell.release_keylock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!cell.load().is_keylocked());
    }
}
