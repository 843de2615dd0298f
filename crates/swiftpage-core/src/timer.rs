//! Clocks.
//!
//! Every cache decision takes "now" from a [`Timer`] so tests can move time
//! deterministically with a [`MockTimer`].

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// A source of wall-clock time.
pub trait Timer: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> TimestampMs;

    /// Current time as a UTC datetime.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_default()
    }
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now_ms(&self) -> TimestampMs {
        Utc::now().timestamp_millis()
    }
}

/// A manually advanced clock for tests.
#[derive(Debug)]
pub struct MockTimer {
    now_ms: AtomicI64,
}

impl MockTimer {
    /// Mon, 05 Apr 2010 18:51:26 GMT
    pub const APR_5_2010_MS: TimestampMs = 1_270_493_486_000;

    /// Creates a timer starting at `start_ms`.
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Moves time forward.
    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the current time.
    pub fn set_time_ms(&self, now_ms: TimestampMs) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new(Self::APR_5_2010_MS)
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> TimestampMs {
        self.now_ms.load(Ordering::SeqCst)
    }
}
