//! WebSocket event throttler (spec.md §4.18, throttler half): categorizes
//! outbound events as critical (always forwarded immediately) or
//! compressible (deduplicated within a short window and optionally batched),
//! so a downstream UI/websocket client isn't flooded during a volatile burst.

use crate::clock::SharedClock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Fills, rejections, kill-switch trips, gate denials — never dropped or
    /// delayed, regardless of how recently a similar event fired.
    Critical,
    /// Quote ticks, staleness readings, equity-curve points — safe to
    /// collapse if several arrive for the same key within the dedup window.
    Compressible,
}

#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub key: String,
    pub category: EventCategory,
    pub payload: Value,
}

pub struct WsThrottler {
    clock: SharedClock,
    dedup_window: chrono::Duration,
    last_sent: HashMap<String, chrono::DateTime<chrono::Utc>>,
    batch: HashMap<String, OutboundEvent>,
}

impl WsThrottler {
    pub fn new(clock: SharedClock, dedup_window: chrono::Duration) -> Self {
        Self {
            clock,
            dedup_window,
            last_sent: HashMap::new(),
            batch: HashMap::new(),
        }
    }

    /// Offers one event to the throttler. Critical events always return
    /// `Some` (sent immediately). Compressible events return `Some` only if
    /// their key hasn't been sent within `dedup_window`; otherwise they're
    /// folded into the pending batch for that key and `None` is returned.
    pub fn offer(&mut self, event: OutboundEvent) -> Option<OutboundEvent> {
        match event.category {
            EventCategory::Critical => Some(event),
            EventCategory::Compressible => {
                let now = self.clock.now();
                let should_send = match self.last_sent.get(&event.key) {
                    Some(last) => now - *last >= self.dedup_window,
                    None => true,
                };
                if should_send {
                    self.last_sent.insert(event.key.clone(), now);
                    self.batch.remove(&event.key);
                    Some(event)
                } else {
                    self.batch.insert(event.key.clone(), event);
                    None
                }
            }
        }
    }

    /// Drains every compressible event currently held back by the dedup
    /// window, for callers that flush on a fixed tick rather than waiting
    /// for the next offer of the same key.
    pub fn drain_batch(&mut self) -> Vec<OutboundEvent> {
        let now = self.clock.now();
        let drained: Vec<String> = self
            .batch
            .keys()
            .filter(|k| match self.last_sent.get(*k) {
                Some(last) => now - *last >= self.dedup_window,
                None => true,
            })
            .cloned()
            .collect();
        drained
            .into_iter()
            .filter_map(|k| {
                self.last_sent.insert(k.clone(), now);
                self.batch.remove(&k)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use serde_json::json;
    use std::sync::Arc;

    fn event(key: &str, category: EventCategory) -> OutboundEvent {
        OutboundEvent {
            key: key.to_string(),
            category,
            payload: json!({"key": key}),
        }
    }

    #[test]
    fn critical_events_always_pass_through() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let mut throttler = WsThrottler::new(clock, chrono::Duration::seconds(1));
        assert!(throttler.offer(event("order_rejected", EventCategory::Critical)).is_some());
        assert!(throttler.offer(event("order_rejected", EventCategory::Critical)).is_some());
    }

    #[test]
    fn compressible_events_are_deduped_within_window() {
        let fixed = FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let clock: SharedClock = Arc::new(fixed.clone());
        let mut throttler = WsThrottler::new(clock, chrono::Duration::seconds(1));
        assert!(throttler.offer(event("quote:EURUSD", EventCategory::Compressible)).is_some());
        assert!(throttler.offer(event("quote:EURUSD", EventCategory::Compressible)).is_none());
        fixed.advance(chrono::Duration::seconds(2));
        assert!(throttler.offer(event("quote:EURUSD", EventCategory::Compressible)).is_some());
    }

    #[test]
    fn dropped_compressible_events_surface_on_batch_drain() {
        let fixed = FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let clock: SharedClock = Arc::new(fixed.clone());
        let mut throttler = WsThrottler::new(clock, chrono::Duration::seconds(1));
        throttler.offer(event("quote:EURUSD", EventCategory::Compressible));
        assert!(throttler.offer(event("quote:EURUSD", EventCategory::Compressible)).is_none());
        assert!(throttler.drain_batch().is_empty());
        fixed.advance(chrono::Duration::seconds(2));
        let drained = throttler.drain_batch();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key, "quote:EURUSD");
    }

    #[test]
    fn distinct_keys_are_throttled_independently() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let mut throttler = WsThrottler::new(clock, chrono::Duration::seconds(1));
        assert!(throttler.offer(event("quote:EURUSD", EventCategory::Compressible)).is_some());
        assert!(throttler.offer(event("quote:GBPUSD", EventCategory::Compressible)).is_some());
    }
}
