//! Monotonic timestamps, as returned by `bpf_ktime_get_ns`.

use std::{fmt, time::Duration};

use nix::time::{ClockId, clock_gettime};
use serde::{Deserialize, Serialize};

/// Nanoseconds since boot, measured with `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Read the current monotonic time. Falls back to zero if the clock is
    /// unavailable, which only happens on exotic platforms.
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64),
            Err(err) => {
                log::warn!("Error reading CLOCK_MONOTONIC: {err}");
                Self(0)
            }
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, saturating at zero.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}
