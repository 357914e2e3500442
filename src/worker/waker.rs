//! # Wait/Wake Primitive
//!
//! The only suspension point of a worker (and of the epoch ticker) between
//! units of work. A sleeper parks on a condvar with a short periodic tick so
//! it re-checks its stop flag even if no wakeup ever arrives; a waker sets a
//! signal flag before notifying so a wakeup that races the sleeper going to
//! sleep is never lost.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct WakerState {
    stop_requested: bool,
    signaled: bool,
}

pub struct Waker {
    state: Mutex<WakerState>,
    condvar: Condvar,
    tick: Duration,
}

impl Waker {
    pub fn new(tick: Duration) -> Self {
        Self {
            state: Mutex::new(WakerState {
                stop_requested: false,
                signaled: false,
            }),
            condvar: Condvar::new(),
            tick,
        }
    }

    /// Parks until a wakeup, a stop request, or one tick elapses.
    ///
    /// Returns whether a stop has been requested; callers loop on
    /// `while !waker.sleep() { ... }`. A signal delivered while the caller
    /// was awake is consumed by the next call without sleeping.
    pub fn sleep(&self) -> bool {
        let mut state = self.state.lock();
        if !state.signaled && !state.stop_requested {
            self.condvar.wait_for(&mut state, self.tick);
        }
        state.signaled = false;
        state.stop_requested
    }

    /// Wakes the sleeper (or pre-arms the next [`Waker::sleep`] call).
    pub fn wakeup(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.condvar.notify_one();
    }

    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop_requested = true;
        self.condvar.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.lock().stop_requested
    }
}
