//! Execution safety net (spec.md §4.10): a size-bounded idempotency cache so
//! a retried submit doesn't double-send, a circuit breaker that trips on a
//! run of broker failures, and a DEMO-mode sanity cap independent of the
//! configured risk limits.

use crate::clock::SharedClock;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Caps the idempotency cache so a long-running process can't leak memory
/// indefinitely; when full, the oldest 10% of entries are evicted at once
/// rather than one-in-one-out, keeping eviction rare and cheap.
const DEFAULT_CAPACITY: usize = 10_000;

struct CacheEntry {
    key: String,
    inserted_order: u64,
}

pub struct IdempotencyGuard {
    capacity: usize,
    entries: Mutex<(VecDeque<CacheEntry>, std::collections::HashSet<String>, u64)>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new((VecDeque::new(), std::collections::HashSet::new(), 0)),
        }
    }

    /// Returns `true` if `key` is newly seen (and records it); `false` if it
    /// was already present, meaning the caller should treat this as a
    /// duplicate submission and not re-send.
    pub fn check_and_record(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut guard = self.entries.lock();
        if guard.1.contains(&key) {
            return false;
        }
        let order = guard.2;
        guard.2 += 1;
        guard.1.insert(key.clone());
        guard.0.push_back(CacheEntry {
            key,
            inserted_order: order,
        });

        if guard.0.len() > self.capacity {
            let evict_count = (self.capacity / 10).max(1);
            for _ in 0..evict_count {
                if let Some(entry) = guard.0.pop_front() {
                    guard.1.remove(&entry.key);
                } else {
                    break;
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

/// Trips after `failure_threshold` consecutive broker failures, blocking
/// further submissions until `cooldown` elapses (auto half-open retry) or a
/// caller explicitly resets it.
pub struct CircuitBreaker {
    clock: SharedClock,
    failure_threshold: u32,
    cooldown: chrono::Duration,
    state: Mutex<CircuitInner>,
}

struct CircuitInner {
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Set once per trip so the router publishes exactly one trip event even
    /// if further failures arrive while already open.
    trip_event_pending: bool,
}

impl CircuitBreaker {
    pub fn new(clock: SharedClock, failure_threshold: u32, cooldown: chrono::Duration) -> Self {
        Self {
            clock,
            failure_threshold,
            cooldown,
            state: Mutex::new(CircuitInner {
                consecutive_failures: 0,
                state: CircuitState::Closed,
                opened_at: None,
                trip_event_pending: false,
            }),
        }
    }

    /// Whether a submission should currently be allowed through. If the
    /// breaker is open but the cooldown has elapsed, it transitions to
    /// closed (half-open retry) and allows exactly this one attempt.
    pub fn allow(&self) -> bool {
        let mut inner = self.state.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| self.clock.now() - at)
                    .unwrap_or(chrono::Duration::zero());
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.state.lock();
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    /// Records a failure. Returns `true` exactly once per trip: the call
    /// that pushes `consecutive_failures` over the threshold.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.state.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold && inner.state == CircuitState::Closed {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(self.clock.now());
            inner.trip_event_pending = true;
            return true;
        }
        false
    }

    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trip_event_pending = false;
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }
}

/// DEMO-mode sanity cap on order size, independent of `RiskLimits`: it
/// exists purely to catch a fat-fingered or misconfigured size before it
/// reaches even a demo account, per spec.md §4.10.
pub fn validate_demo_size(size: f64, demo_max_size: f64) -> Result<(), String> {
    if size <= 0.0 {
        return Err("order size must be positive".to_string());
    }
    if size > demo_max_size {
        return Err(format!("size {size} exceeds DEMO sanity cap {demo_max_size}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    #[test]
    fn idempotency_guard_rejects_repeated_key() {
        let guard = IdempotencyGuard::new();
        assert!(guard.check_and_record("a"));
        assert!(!guard.check_and_record("a"));
        assert!(guard.check_and_record("b"));
    }

    #[test]
    fn idempotency_guard_evicts_oldest_tenth_when_full() {
        let guard = IdempotencyGuard::with_capacity(10);
        for i in 0..11 {
            assert!(guard.check_and_record(format!("k{i}")));
        }
        assert!(guard.len() <= 10);
        // oldest key should have been evicted and can be re-recorded as new
        assert!(guard.check_and_record("k0"));
    }

    #[test]
    fn circuit_breaker_trips_after_threshold_and_reports_once() {
        let clock: SharedClock = std::sync::Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let breaker = CircuitBreaker::new(clock, 3, chrono::Duration::seconds(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(!breaker.record_failure()); // already open, no second trip event
        assert!(!breaker.allow());
    }

    #[test]
    fn circuit_breaker_half_opens_after_cooldown() {
        let fixed = FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let clock: SharedClock = std::sync::Arc::new(fixed.clone());
        let breaker = CircuitBreaker::new(clock, 1, chrono::Duration::seconds(30));
        breaker.record_failure();
        assert!(!breaker.allow());
        fixed.advance(chrono::Duration::seconds(31));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn demo_size_cap_rejects_oversized_order() {
        assert!(validate_demo_size(1.0, 5.0).is_ok());
        assert!(validate_demo_size(6.0, 5.0).is_err());
        assert!(validate_demo_size(-1.0, 5.0).is_err());
    }
}
