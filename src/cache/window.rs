//! Sliding time-window event counter (spec.md §4.2), used by the risk
//! engine's trade-frequency check and the autopilot's global rate limiter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard cap on retained timestamps regardless of window size, so a caller
/// that never calls `count` can't grow this unboundedly.
const MAX_RETAINED: usize = 100_000;

pub struct WindowedCounter {
    window: Duration,
    events: parking_lot::Mutex<VecDeque<Instant>>,
}

impl WindowedCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, at: Instant) {
        let mut events = self.events.lock();
        events.push_back(at);
        if events.len() > MAX_RETAINED {
            events.pop_front();
        }
    }

    /// Count of events whose timestamp falls within the last `window`
    /// seconds of `now`.
    pub fn count(&self, now: Instant) -> usize {
        let mut events = self.events.lock();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while matches!(events.front(), Some(t) if *t < cutoff) {
            events.pop_front();
        }
        events.len()
    }

    pub fn count_now(&self) -> usize {
        self.count(Instant::now())
    }

    pub fn reset(&self) {
        self.events.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_events_within_window() {
        let counter = WindowedCounter::new(Duration::from_secs(60));
        let t0 = Instant::now();
        counter.record_at(t0);
        counter.record_at(t0 + Duration::from_secs(30));
        counter.record_at(t0 + Duration::from_secs(70));
        assert_eq!(counter.count(t0 + Duration::from_secs(75)), 2);
    }

    #[test]
    fn hard_cap_prevents_unbounded_growth() {
        let counter = WindowedCounter::new(Duration::from_secs(3600));
        for _ in 0..(MAX_RETAINED + 50) {
            counter.record();
        }
        assert!(counter.events.lock().len() <= MAX_RETAINED);
    }
}
