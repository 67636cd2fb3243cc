//! Time utilities: timestamps, deadlines and an injectable clock.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Deadline for a timeout starting at `start`; non-positive timeouts never expire.
pub fn deadline_after(start: Timestamp, timeout: Duration) -> Option<Timestamp> {
    if timeout <= Duration::zero() {
        None
    } else {
        start.checked_add_signed(timeout)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis(timestamp: Timestamp) -> i64 {
    timestamp.timestamp_millis()
}

/// Timestamp from milliseconds since the Unix epoch.
pub fn from_epoch_millis(millis: i64) -> Option<Timestamp> {
    Utc.timestamp_millis_opt(millis).single()
}

/// The earlier of two optional deadlines, where `None` means never.
pub fn earliest(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Duration extensions for convenient conversion.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// Source of the current time.
///
/// Deadline and retention decisions go through a `Clock` so that they can be
/// driven deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(now())
    }

    /// Create a clock frozen at `start`.
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write();
        *current = *current + by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Timestamp) {
        *self.current.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.read()
    }
}
