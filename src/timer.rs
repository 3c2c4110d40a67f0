//! LPWAN Timer API
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Monotonic time source driving MAC timeouts and backoffs.
///
/// Both methods count from the same fixed, unspecified epoch.
pub trait Timer {
    /// Microseconds since the epoch
    fn ticks_us(&self) -> Ts;

    /// Milliseconds since the epoch
    fn ticks_ms(&self) -> u64 {
        self.ticks_us() / 1_000
    }
}

/// Single-slot deadline holding at most one scheduled action.
///
/// Arming replaces any previously armed action, cancelling is idempotent,
/// and an action fires (and disarms the slot) exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Deadline<A> {
    pending: Option<(Ts, A)>,
}

impl <A> Default for Deadline<A> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl <A> Deadline<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` at `at_us`, dropping whatever was scheduled before
    pub fn arm(&mut self, at_us: Ts, action: A) {
        self.pending = Some((at_us, action));
    }

    /// Cancel the pending action, if any
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Time at which the pending action is due
    pub fn due(&self) -> Option<Ts> {
        self.pending.as_ref().map(|(t, _)| *t)
    }

    /// Take the pending action if it is due at `now_us`
    pub fn poll(&mut self, now_us: Ts) -> Option<A> {
        match &self.pending {
            Some((t, _)) if *t <= now_us => self.pending.take().map(|(_, a)| a),
            _ => None,
        }
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    use crate::Ts;

    /// Manually advanced clock, clones share the same time
    #[derive(Clone, Debug, Default)]
    pub struct MockTimer(Arc<Mutex<Ts>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_us(&mut self, us: Ts) {
            *self.0.lock().unwrap() = us;
        }

        /// Advance the clock by `us` microseconds
        pub fn inc_us(&mut self, us: Ts) {
            *self.0.lock().unwrap() += us;
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_us(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }
}
