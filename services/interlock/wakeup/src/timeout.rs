//! Caller timeouts and their mapping onto `poll(2)` timeouts.
//!
//! Callers pass timeouts in milliseconds where `0` means "wait forever".
//! `poll(2)` treats `0` as "return immediately" and `-1` as "wait forever",
//! so the two conventions must never be mixed up.

use nix::libc;
use std::time::{Duration, Instant};

/// Poll timeout that blocks indefinitely
pub const POLL_INFINITE: libc::c_int = -1;

/// Timeout of a single readiness wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Wait until ready or interrupted
    Infinite,
    /// Wait at most this long
    After(Duration),
}

impl WaitTimeout {
    /// Build from the caller convention, where `0` means wait forever
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            WaitTimeout::Infinite
        } else {
            WaitTimeout::After(Duration::from_millis(millis))
        }
    }

    /// Back to the caller convention
    pub fn as_millis(&self) -> u64 {
        match self {
            WaitTimeout::Infinite => 0,
            WaitTimeout::After(d) => (d.as_millis() as u64).max(1),
        }
    }

    /// Start the clock for one wait
    pub fn start(&self) -> Deadline {
        match self {
            WaitTimeout::Infinite => Deadline { at: None },
            // Overflowing deadlines are as good as unbounded
            WaitTimeout::After(d) => Deadline {
                at: Instant::now().checked_add(*d),
            },
        }
    }
}

impl From<Option<Duration>> for WaitTimeout {
    fn from(value: Option<Duration>) -> Self {
        match value {
            Some(d) if !d.is_zero() => WaitTimeout::After(d),
            _ => WaitTimeout::Infinite,
        }
    }
}

/// Absolute end of one wait
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Remaining time, `None` when the wait is unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether a bounded wait has run out
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Timeout argument for the next `poll(2)` call.
    ///
    /// Sub-millisecond remainders round up so the wait never ends early.
    pub fn poll_millis(&self) -> libc::c_int {
        match self.remaining() {
            None => POLL_INFINITE,
            Some(d) => {
                let millis = d.as_micros().div_ceil(1000);
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}
