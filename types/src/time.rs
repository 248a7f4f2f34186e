//! Timestamp type and the clock seam used throughout the engine.
//!
//! Timestamps are Unix epoch seconds (UTC). Heartbeat skew checks and every
//! SLA deadline are expressed in whole seconds; the millisecond reading on
//! [`Clock`] exists only for rate limiting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A Unix timestamp in seconds since epoch (UTC).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch (time zero).
    pub const EPOCH: Self = Self(0);

    pub fn new(secs: u64) -> Self {
        Self(secs)
    }

    /// Get the current system time as a `Timestamp`.
    ///
    /// A system clock set before 1970 reads as the epoch.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// This timestamp shifted forward by `secs`, saturating at `u64::MAX`.
    pub fn plus(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    /// Seconds elapsed since this timestamp (relative to `now`).
    pub fn elapsed_since(&self, now: Timestamp) -> u64 {
        now.0.saturating_sub(self.0)
    }

    /// Whether this timestamp + duration has passed relative to `now`.
    pub fn has_expired(&self, duration_secs: u64, now: Timestamp) -> bool {
        now.0 >= self.0.saturating_add(duration_secs)
    }

    /// Absolute distance in seconds between two timestamps.
    pub fn abs_diff(&self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Source of wall-clock time.
///
/// Every component takes its time from an injected `Clock` so tests can
/// drive deadlines deterministically (see `proxy-nullables`).
pub trait Clock: Send + Sync {
    /// Current time in whole seconds.
    fn now(&self) -> Timestamp;

    /// Current time in milliseconds since the epoch.
    fn now_millis(&self) -> u64;
}

/// The production clock, backed by `SystemTime`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_expired_is_inclusive() {
        let t = Timestamp::new(100);
        assert!(!t.has_expired(10, Timestamp::new(109)));
        assert!(t.has_expired(10, Timestamp::new(110)));
    }

    #[test]
    fn elapsed_since_saturates() {
        let t = Timestamp::new(100);
        assert_eq!(t.elapsed_since(Timestamp::new(50)), 0);
        assert_eq!(t.elapsed_since(Timestamp::new(160)), 60);
    }

    #[test]
    fn plus_saturates() {
        assert_eq!(Timestamp::new(u64::MAX).plus(5).as_secs(), u64::MAX);
    }

    #[test]
    fn system_clock_agrees_with_millis() {
        let clock = SystemClock;
        let secs = clock.now().as_secs();
        let millis = clock.now_millis();
        assert!(millis / 1000 >= secs);
    }
}
