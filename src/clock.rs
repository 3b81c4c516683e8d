//! Mesh timestamps.
//!
//! All object timestamps are milliseconds since the Unix epoch as seen by a
//! [`Clock`]. The clock reads the wall clock once, at construction, and then
//! advances with tokio's monotonic `Instant`, so timestamps never go
//! backwards and paused-time tests can move them with `tokio::time::advance`.
//!
//! Meshes that must agree on time (everything in one process) share a clone
//! of the same clock through their `MeshContext`.

use std::time::Duration;
use tokio::time::Instant;

/// Millisecond timestamp. [`NEVER`] means unset.
pub type Timestamp = i64;

/// Sentinel for "never" / "not set".
pub const NEVER: Timestamp = -1;

/// Monotonic millisecond clock anchored to the wall clock.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch_ms: i64,
    origin: Instant,
}

impl Clock {
    /// Anchor a clock at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    /// Anchor a clock at a fixed timestamp (useful in tests).
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    /// Current time in milliseconds.
    pub fn now(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_millis();
        self.epoch_ms.saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }

    /// Timestamp `delta` from now.
    pub fn after(&self, delta: Duration) -> Timestamp {
        add_duration(self.now(), delta)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Add a duration to a timestamp, saturating.
pub fn add_duration(ts: Timestamp, delta: Duration) -> Timestamp {
    ts.saturating_add(i64::try_from(delta.as_millis()).unwrap_or(i64::MAX))
}

/// Milliseconds between two timestamps, clamped at zero.
pub fn millis_between(earlier: Timestamp, later: Timestamp) -> u64 {
    u64::try_from(later.saturating_sub(earlier)).unwrap_or(0)
}
