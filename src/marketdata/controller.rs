//! Market-data controller (spec.md §4.16): owns the stream-vs-poll state
//! machine for a single symbol subscription. Prefers a push stream; falls
//! back to polling with exponential backoff plus jitter when the stream
//! misbehaves, and promotes back to streaming once it recovers.

use crate::clock::SharedClock;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Streaming,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Connecting,
    Active(FeedMode),
    Backoff(FeedMode),
}

pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Exponential backoff capped at `max`, with up to `jitter_ratio` of
    /// random jitter added so many reconnecting symbols don't all retry in
    /// lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt.min(20) as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        let jitter = capped * self.jitter_ratio * rand::thread_rng().gen::<f64>();
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// Threshold of consecutive stream failures before falling back to polling.
const FALLBACK_THRESHOLD: u32 = 3;
/// Consecutive successful polls required before attempting to promote back
/// to streaming.
const PROMOTE_THRESHOLD: u32 = 5;

pub struct MarketDataController {
    clock: SharedClock,
    backoff: BackoffPolicy,
    state: ControllerState,
    consecutive_stream_failures: u32,
    consecutive_poll_successes: u32,
    attempt: u32,
    last_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MarketDataController {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            backoff: BackoffPolicy::default(),
            state: ControllerState::Connecting,
            consecutive_stream_failures: 0,
            consecutive_poll_successes: 0,
            attempt: 0,
            last_event_at: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn on_stream_connected(&mut self) {
        self.state = ControllerState::Active(FeedMode::Streaming);
        self.consecutive_stream_failures = 0;
        self.attempt = 0;
        self.last_event_at = Some(self.clock.now());
    }

    /// Records a stream failure. Once `FALLBACK_THRESHOLD` consecutive
    /// failures accumulate, transitions to `Backoff(Polling)` and returns the
    /// delay the caller should wait before starting to poll.
    pub fn on_stream_failure(&mut self) -> Option<Duration> {
        self.consecutive_stream_failures += 1;
        if self.consecutive_stream_failures >= FALLBACK_THRESHOLD {
            self.attempt += 1;
            self.state = ControllerState::Backoff(FeedMode::Polling);
            Some(self.backoff.delay_for_attempt(self.attempt))
        } else {
            None
        }
    }

    pub fn on_poll_tick(&mut self, success: bool) {
        self.last_event_at = Some(self.clock.now());
        if success {
            self.consecutive_poll_successes += 1;
            self.state = ControllerState::Active(FeedMode::Polling);
        } else {
            self.consecutive_poll_successes = 0;
        }
    }

    /// Whether enough consecutive successful polls have accumulated to
    /// justify attempting to re-promote to streaming.
    pub fn should_attempt_promote(&self) -> bool {
        self.state == ControllerState::Active(FeedMode::Polling) && self.consecutive_poll_successes >= PROMOTE_THRESHOLD
    }

    pub fn attempt_promote(&mut self) {
        self.state = ControllerState::Connecting;
        self.consecutive_poll_successes = 0;
    }

    /// Seconds since the last bar/quote event, used by the metrics-only
    /// staleness reading (spec.md §9: staleness is informational, never a
    /// trigger on its own).
    pub fn staleness_secs(&self) -> Option<i64> {
        self.last_event_at.map(|at| (self.clock.now() - at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::Arc;

    fn clock() -> SharedClock {
        Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()))
    }

    #[test]
    fn falls_back_to_polling_after_threshold_failures() {
        let mut controller = MarketDataController::new(clock());
        controller.on_stream_connected();
        assert!(controller.on_stream_failure().is_none());
        assert!(controller.on_stream_failure().is_none());
        let delay = controller.on_stream_failure();
        assert!(delay.is_some());
        assert_eq!(controller.state(), ControllerState::Backoff(FeedMode::Polling));
    }

    #[test]
    fn backoff_delay_grows_with_attempts_and_stays_capped() {
        let policy = BackoffPolicy::default();
        let d1 = policy.delay_for_attempt(1);
        let d5 = policy.delay_for_attempt(5);
        let d30 = policy.delay_for_attempt(30);
        assert!(d5 >= d1);
        assert!(d30 <= policy.max + policy.max.mul_f64(policy.jitter_ratio));
    }

    #[test]
    fn promotes_back_to_streaming_after_enough_successful_polls() {
        let mut controller = MarketDataController::new(clock());
        controller.on_stream_connected();
        for _ in 0..3 {
            controller.on_stream_failure();
        }
        for _ in 0..5 {
            controller.on_poll_tick(true);
        }
        assert!(controller.should_attempt_promote());
        controller.attempt_promote();
        assert_eq!(controller.state(), ControllerState::Connecting);
    }

    #[test]
    fn a_single_poll_failure_resets_the_promote_counter() {
        let mut controller = MarketDataController::new(clock());
        controller.on_stream_connected();
        for _ in 0..3 {
            controller.on_stream_failure();
        }
        controller.on_poll_tick(true);
        controller.on_poll_tick(true);
        controller.on_poll_tick(false);
        assert!(!controller.should_attempt_promote());
    }
}
