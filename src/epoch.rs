//! # Epoch Clock
//!
//! The global epoch is the coarse-grained serialization clock of the engine.
//! Every committed transaction stamps the epoch it committed in into its TID,
//! and cross-worker ordering is resolved epoch-first. A background ticker
//! advances the counter once per [`EPOCH_TICK`](crate::config::EPOCH_TICK)
//! (nominally 20 ms).
//!
//! ## Value Range and Wrap-Around
//!
//! Epochs occupy the top 28 bits of the TID word, so the counter runs in
//! `[1, 2^28)`. Zero is reserved as the invalid epoch: it marks records that
//! have never been committed to and is *before* every valid epoch.
//!
//! At 20 ms per tick the counter wraps after roughly two months of uptime,
//! so comparison is wrap-aware: `a.before(b)` is defined by the sign of the
//! modular distance between the two values. Distances of half the range or
//! more are meaningless and rejected as programmer error in debug builds.
//! The engine never holds references to epochs anywhere near that old.
//!
//! ```text
//!        0 (invalid)
//!        │
//!  ┌─────▼──────────────────────────────────────┐
//!  │ 1  2  3  ...                   2^28-1 ──┐  │
//!  │ ▲                                       │  │
//!  │ └──────────── wraps to 1 ───────────────┘  │
//!  └────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! - `current`: a single `AtomicU32`, advanced by CAS, read by every
//!   worker at transaction start and commit.
//! - Advancement notifies a condvar so callers can block until a given
//!   serialization point has passed ([`EpochClock::wait_until_advanced`]).
//! - The ticker itself is owned by the transaction manager; this module
//!   only provides the passive cell plus the advance/notify protocol.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::{EPOCH_INT_HALF, EPOCH_INT_OVERFLOW};

/// Raw integer representation of an epoch, always `< EPOCH_INT_OVERFLOW`.
pub type EpochInt = u32;

/// A wrap-aware point on the global serialization clock.
///
/// `Epoch` is a plain value; the shared mutable counter is [`EpochClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Epoch(EpochInt);

impl Epoch {
    /// The reserved invalid epoch, before everything else.
    pub const INVALID: Epoch = Epoch(0);

    /// The first valid epoch. The clock starts here so that epoch zero
    /// stays a reliable "never committed" marker.
    pub const FIRST: Epoch = Epoch(1);

    pub fn new(value: EpochInt) -> Self {
        debug_assert!(value < EPOCH_INT_OVERFLOW);
        Epoch(value)
    }

    #[inline]
    pub fn value(self) -> EpochInt {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Signed modular distance from `self` to `other`.
    ///
    /// Defined only when both epochs are valid and within half the epoch
    /// range of each other; anything else is a programmer error.
    pub fn distance(self, other: Epoch) -> i32 {
        debug_assert!(self.is_valid());
        debug_assert!(other.is_valid());
        let diff = other.0.wrapping_sub(self.0) & (EPOCH_INT_OVERFLOW - 1);
        debug_assert!(
            diff == 0 || diff < EPOCH_INT_HALF || diff > EPOCH_INT_OVERFLOW - EPOCH_INT_HALF,
            "epochs {} and {} are too far apart to compare",
            self.0,
            other.0
        );
        if diff < EPOCH_INT_HALF {
            diff as i32
        } else {
            -((EPOCH_INT_OVERFLOW - diff) as i32)
        }
    }

    /// Whether `self` is strictly before `other` on the wrap-aware clock.
    ///
    /// An invalid epoch is before every valid epoch. `other` must be valid.
    pub fn before(self, other: Epoch) -> bool {
        debug_assert!(other.is_valid());
        if !self.is_valid() {
            return true;
        }
        self.distance(other) > 0
    }

    /// The next epoch on the clock, skipping the reserved zero on wrap.
    pub fn next(self) -> Epoch {
        let incremented = (self.0 + 1) & (EPOCH_INT_OVERFLOW - 1);
        if incremented == 0 {
            Epoch::FIRST
        } else {
            Epoch(incremented)
        }
    }

    /// `max` by [`Epoch::before`], treating invalid as the minimum.
    pub fn store_max(&mut self, other: Epoch) {
        if other.is_valid() && (!self.is_valid() || self.before(other)) {
            *self = other;
        }
    }
}

/// The process-wide epoch counter.
///
/// Advanced by the ticker thread (and, rarely, by a committer that ran out
/// of per-epoch ordinals), read by all workers. Readers use acquire loads
/// so that everything published before an epoch advance is visible to
/// transactions that observe the new epoch.
pub struct EpochClock {
    current: AtomicU32,
    advanced_mutex: Mutex<()>,
    advanced: Condvar,
}

impl EpochClock {
    pub fn new() -> Self {
        Self {
            current: AtomicU32::new(Epoch::FIRST.value()),
            advanced_mutex: Mutex::new(()),
            advanced: Condvar::new(),
        }
    }

    #[inline]
    pub fn current(&self) -> Epoch {
        Epoch::new(self.current.load(Ordering::Acquire))
    }

    /// Advance the clock by one tick and notify all waiters.
    ///
    /// Normally only the ticker calls this, but a worker that exhausts its
    /// per-epoch ordinal space closes the epoch itself, so advancement is a
    /// CAS loop rather than a plain store.
    pub fn advance(&self) -> Epoch {
        loop {
            let current = self.current.load(Ordering::Acquire);
            let next = Epoch::new(current).next();
            if self
                .current
                .compare_exchange_weak(current, next.value(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _guard = self.advanced_mutex.lock();
                self.advanced.notify_all();
                return next;
            }
        }
    }

    /// Block until the clock has moved past `epoch` or `timeout` elapses.
    ///
    /// Returns the current epoch at the time of return. Callers use this to
    /// wait for a serialization point (e.g. a commit epoch) to close.
    pub fn wait_until_advanced(&self, epoch: Epoch, timeout: Duration) -> Epoch {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.advanced_mutex.lock();
        loop {
            let now = self.current();
            if epoch.before(now) {
                return now;
            }
            if self.advanced.wait_until(&mut guard, deadline).timed_out() {
                return self.current();
            }
        }
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_epoch_is_before_everything() {
        assert!(!Epoch::INVALID.is_valid());
        assert!(Epoch::INVALID.before(Epoch::FIRST));
        assert!(Epoch::INVALID.before(Epoch::new(12345)));
    }

    #[test]
    fn before_is_strict() {
        let e = Epoch::new(42);
        assert!(!e.before(e));
        assert!(e.before(Epoch::new(43)));
        assert!(!Epoch::new(43).before(e));
    }

    #[test]
    fn distance_is_signed() {
        assert_eq!(Epoch::new(10).distance(Epoch::new(13)), 3);
        assert_eq!(Epoch::new(13).distance(Epoch::new(10)), -3);
        assert_eq!(Epoch::new(7).distance(Epoch::new(7)), 0);
    }

    #[test]
    fn wrap_around_comparison() {
        let near_wrap = Epoch::new(EPOCH_INT_OVERFLOW - 2);
        let wrapped = Epoch::new(3);
        assert!(near_wrap.before(wrapped));
        assert!(!wrapped.before(near_wrap));
        assert_eq!(near_wrap.distance(wrapped), 5);
    }

    #[test]
    fn antisymmetric_within_half_range() {
        let pairs = [(1u32, 2u32), (100, EPOCH_INT_HALF - 1), (EPOCH_INT_OVERFLOW - 1, 1)];
        for (a, b) in pairs {
            let (a, b) = (Epoch::new(a), Epoch::new(b));
            assert!(a.before(b));
            assert!(!b.before(a));
        }
    }

    #[test]
    fn next_skips_invalid_on_wrap() {
        assert_eq!(Epoch::new(5).next(), Epoch::new(6));
        assert_eq!(Epoch::new(EPOCH_INT_OVERFLOW - 1).next(), Epoch::FIRST);
    }

    #[test]
    fn store_max_keeps_later_epoch() {
        let mut e = Epoch::INVALID;
        e.store_max(Epoch::new(4));
        assert_eq!(e, Epoch::new(4));
        e.store_max(Epoch::new(2));
        assert_eq!(e, Epoch::new(4));
        e.store_max(Epoch::new(9));
        assert_eq!(e, Epoch::new(9));
        e.store_max(Epoch::INVALID);
        assert_eq!(e, Epoch::new(9));
    }

    #[test]
    fn clock_starts_at_first_valid_epoch() {
        let clock = EpochClock::new();
        assert_eq!(clock.current(), Epoch::FIRST);
    }

    #[test]
    fn clock_advance_notifies_waiter() {
        use std::sync::Arc;

        let clock = Arc::new(EpochClock::new());
        let observed = clock.current();
        let waiter = {
            let clock = Arc::clone(&clock);
            std::thread::spawn(move || clock.wait_until_advanced(observed, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        clock.advance();
        let now = waiter.join().unwrap();
        assert!(observed.before(now));
    }
}
