//! Clock capability for injectable time.
//!
//! Everything in the delivery engine that reads the current time (backoff
//! scheduling, lease expiry, claim eligibility) goes through [`Clock`], so
//! retry behavior is inspectable in tests without real delays. Production
//! code uses [`SystemClock`]; test clocks live in `carrier-testing`.

use chrono::{DateTime, Utc};

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
