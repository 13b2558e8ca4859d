//! Deterministic clocks for retry and lease tests.

use carrier_core::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// A clock frozen at a single instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    /// Create a clock that always reports `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// A clock that only moves when the test says so.
///
/// Backoff and lease-expiry behavior become synchronous assertions: advance
/// past the scheduled `available_at` (or past the lease) and observe the
/// record become claimable, with no real sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a manual clock starting at the current wall time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward by `step`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, step: Duration) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += ChronoDuration::milliseconds(step.as_millis() as i64);
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let instant = Utc::now();
        let clock = FixedClock::new(instant);

        assert_eq!(clock.now(), instant);
        assert_eq!(clock.now(), instant);
    }

    #[test]
    fn manual_clock_advances_by_steps() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + ChronoDuration::seconds(5));

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), start + ChronoDuration::milliseconds(5250));
    }

    #[test]
    fn manual_clock_set_jumps() {
        let clock = ManualClock::starting_now();
        let target = Utc::now() + ChronoDuration::days(1);

        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
