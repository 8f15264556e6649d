//! Quote/bar publisher (spec.md §4.18, publisher half): throttles how often
//! a quote update for a given symbol is forwarded downstream, while bars —
//! being discrete, already-deduplicated events — are never throttled.

use crate::clock::SharedClock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub bid: f64,
    pub offer: f64,
}

pub struct QuotePublisher {
    clock: SharedClock,
    min_interval: chrono::Duration,
    last_published_at: HashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl QuotePublisher {
    pub fn new(clock: SharedClock, max_quotes_per_sec: f64) -> Self {
        let interval_ms = if max_quotes_per_sec > 0.0 {
            (1000.0 / max_quotes_per_sec) as i64
        } else {
            0
        };
        Self {
            clock,
            min_interval: chrono::Duration::milliseconds(interval_ms),
            last_published_at: HashMap::new(),
        }
    }

    /// Returns `true` if a quote for `symbol` should be published now. A
    /// symbol's first quote always publishes; subsequent quotes are
    /// throttled to at most one per `min_interval`.
    pub fn should_publish_quote(&mut self, symbol: &str) -> bool {
        let now = self.clock.now();
        match self.last_published_at.get(symbol) {
            Some(last) if now - *last < self.min_interval => false,
            _ => {
                self.last_published_at.insert(symbol.to_string(), now);
                true
            }
        }
    }

    /// Bars are never throttled: every finalized bar is a discrete event the
    /// downstream consumer needs to see exactly once, unlike a continuous
    /// quote stream.
    pub fn should_publish_bar(&self) -> bool {
        true
    }
}
