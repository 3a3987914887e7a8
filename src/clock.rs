//! Wall-clock sources.
//!
//! Counter timestamps are persisted and compared across processes, so time is
//! expressed as floating point seconds since the Unix epoch rather than as a
//! process-local `Instant`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A source of "now" in seconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> f64;
}

/// Clock backed by the host's system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a store and a backend handed
/// clones of one `ManualClock` always agree on "now".
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds since the epoch.
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by.as_secs_f64();
    }

    /// Set the clock to an absolute time. Moving backwards is allowed.
    pub fn set(&self, now: f64) {
        *self.current.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock::new().now() > 1_577_836_800.0);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(100.0);
        let other = clock.clone();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 100.25);

        clock.set(50.0);
        assert_eq!(other.now(), 50.0);
    }
}
