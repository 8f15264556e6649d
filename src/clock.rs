//! Time source abstraction.
//!
//! Every component that stamps an event, a ledger row, or a gate timestamp
//! goes through a `Clock` rather than calling `Utc::now()` directly. This
//! keeps backtests, gate/kill-switch tests and idempotency-window tests
//! reproducible, and avoids mixing naive and timezone-aware timestamps.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock. Used everywhere outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, with an optional step so successive
/// calls advance deterministically (useful for asserting strict ordering in
/// tests without sleeping).
#[derive(Debug, Clone)]
pub struct FixedClock {
    current: std::sync::Arc<parking_lot::Mutex<DateTime<Utc>>>,
    step: chrono::Duration,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: std::sync::Arc::new(parking_lot::Mutex::new(start)),
            step: chrono::Duration::zero(),
        }
    }

    pub fn with_step(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            current: std::sync::Arc::new(parking_lot::Mutex::new(start)),
            step,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.current.lock();
        *guard += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.current.lock();
        let now = *guard;
        if self.step != chrono::Duration::zero() {
            *guard += self.step;
        }
        now
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_holds_value_until_advanced() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }

    #[test]
    fn stepped_clock_advances_on_each_read() {
        let start = Utc::now();
        let clock = FixedClock::with_step(start, chrono::Duration::seconds(1));
        let t0 = clock.now();
        let t1 = clock.now();
        assert_eq!(t1, t0 + chrono::Duration::seconds(1));
    }
}
