//! Order tracker registry (spec.md §4.8): owns every in-flight and
//! recently-terminal `OrderTracker`, keyed by the client-generated
//! `deal_reference` so broker acks can be matched back to the intent that
//! produced them regardless of arrival order.

use crate::clock::SharedClock;
use crate::domain::{IllegalTransition, OrderIntent, OrderStatus, OrderTracker};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("intent {0} already submitted")]
    DuplicateIntent(Uuid),
    #[error("no tracker for deal_reference")]
    UnknownDealReference,
    #[error("no tracker for deal_id")]
    UnknownDealId,
}

/// How long a terminal tracker is kept around after reaching a terminal
/// state before `purge_stale` removes it, so the registry doesn't grow
/// unbounded over a long-running process.
const DEFAULT_RETENTION_SECS: i64 = 24 * 3600;

pub struct OrderRegistry {
    clock: SharedClock,
    retention: chrono::Duration,
    trackers: RwLock<HashMap<String, OrderTracker>>,
    intent_index: RwLock<HashMap<Uuid, String>>,
    deal_id_index: RwLock<HashMap<String, String>>,
    terminal_at: RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>,
}

impl OrderRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            retention: chrono::Duration::seconds(DEFAULT_RETENTION_SECS),
            trackers: RwLock::new(HashMap::new()),
            intent_index: RwLock::new(HashMap::new()),
            deal_id_index: RwLock::new(HashMap::new()),
            terminal_at: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Registers a new submission attempt. Rejects a second registration for
    /// an `intent_id` already tracked (whether or not it has reached a
    /// terminal state) — each intent is submitted at most once.
    pub fn register(&self, intent: &OrderIntent, deal_reference: impl Into<String>) -> Result<(), RegistryError> {
        let mut intent_index = self.intent_index.write();
        if intent_index.contains_key(&intent.intent_id) {
            return Err(RegistryError::DuplicateIntent(intent.intent_id));
        }
        let deal_reference = deal_reference.into();
        let tracker = OrderTracker::new(intent.intent_id, deal_reference.clone(), self.clock.now());
        self.trackers.write().insert(deal_reference.clone(), tracker);
        intent_index.insert(intent.intent_id, deal_reference);
        Ok(())
    }

    /// Records the broker-assigned `deal_id` once the order is acknowledged,
    /// wiring the reverse index so later acks keyed by `deal_id` resolve.
    pub fn bind_deal_id(&self, deal_reference: &str, deal_id: impl Into<String>) -> Result<(), RegistryError> {
        let deal_id = deal_id.into();
        let mut trackers = self.trackers.write();
        let tracker = trackers.get_mut(deal_reference).ok_or(RegistryError::UnknownDealReference)?;
        tracker.deal_id = Some(deal_id.clone());
        self.deal_id_index.write().insert(deal_id, deal_reference.to_string());
        Ok(())
    }

    /// Applies a status transition by `deal_reference`. Illegal or
    /// out-of-order transitions are swallowed (not propagated as fatal) per
    /// the registry's ordering guarantee; the caller still learns about it
    /// via the returned `Result` for logging.
    pub fn transition_by_reference(
        &self,
        deal_reference: &str,
        next: OrderStatus,
    ) -> Result<Result<(), IllegalTransition>, RegistryError> {
        let mut trackers = self.trackers.write();
        let tracker = trackers.get_mut(deal_reference).ok_or(RegistryError::UnknownDealReference)?;
        let now = self.clock.now();
        let outcome = tracker.transition(next, now);
        if tracker.status.is_terminal() {
            self.terminal_at.write().insert(deal_reference.to_string(), now);
        }
        Ok(outcome)
    }

    pub fn transition_by_deal_id(
        &self,
        deal_id: &str,
        next: OrderStatus,
    ) -> Result<Result<(), IllegalTransition>, RegistryError> {
        let deal_reference = self
            .deal_id_index
            .read()
            .get(deal_id)
            .cloned()
            .ok_or(RegistryError::UnknownDealId)?;
        self.transition_by_reference(&deal_reference, next)
    }

    pub fn get(&self, deal_reference: &str) -> Option<OrderTracker> {
        self.trackers.read().get(deal_reference).cloned()
    }

    pub fn get_by_intent(&self, intent_id: Uuid) -> Option<OrderTracker> {
        let deal_reference = self.intent_index.read().get(&intent_id).cloned()?;
        self.get(&deal_reference)
    }

    pub fn open_count(&self) -> u32 {
        self.trackers.read().values().filter(|t| !t.status.is_terminal()).count() as u32
    }

    /// Broker-assigned `deal_id`s of every non-terminal tracker that has
    /// been acknowledged (and therefore has a `deal_id` to compare against
    /// the broker's own position list).
    pub fn open_deal_ids(&self) -> Vec<String> {
        self.trackers
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| t.deal_id.clone())
            .collect()
    }

    /// Drops trackers that reached a terminal state more than `retention`
    /// ago. Returns the number purged.
    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let mut terminal_at = self.terminal_at.write();
        let stale: Vec<String> = terminal_at
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for deal_reference in &stale {
            terminal_at.remove(deal_reference);
            if let Some(tracker) = self.trackers.write().remove(deal_reference) {
                self.intent_index.write().remove(&tracker.intent_id);
                if let Some(deal_id) = tracker.deal_id {
                    self.deal_id_index.write().remove(&deal_id);
                }
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::Side;

    fn clock(start: &str) -> SharedClock {
        std::sync::Arc::new(FixedClock::new(start.parse().unwrap()))
    }

    #[test]
    fn duplicate_intent_registration_is_rejected() {
        let registry = OrderRegistry::new(clock("2024-01-01T00:00:00Z"));
        let intent = OrderIntent::new("EURUSD", Side::Buy, 1.0, "bot");
        registry.register(&intent, "ref-1").unwrap();
        let err = registry.register(&intent, "ref-2").unwrap_err();
        assert_eq!(err, RegistryError::DuplicateIntent(intent.intent_id));
    }

    #[test]
    fn deal_id_resolves_back_to_tracker_after_ack() {
        let registry = OrderRegistry::new(clock("2024-01-01T00:00:00Z"));
        let intent = OrderIntent::new("EURUSD", Side::Buy, 1.0, "bot");
        registry.register(&intent, "ref-1").unwrap();
        registry.bind_deal_id("ref-1", "DEAL-1").unwrap();
        registry
            .transition_by_reference("ref-1", OrderStatus::Submitted)
            .unwrap()
            .unwrap();
        registry
            .transition_by_deal_id("DEAL-1", OrderStatus::Acknowledged)
            .unwrap()
            .unwrap();
        let tracker = registry.get_by_intent(intent.intent_id).unwrap();
        assert_eq!(tracker.status, OrderStatus::Acknowledged);
    }

    #[test]
    fn out_of_order_ack_is_reported_not_panicking() {
        let registry = OrderRegistry::new(clock("2024-01-01T00:00:00Z"));
        let intent = OrderIntent::new("EURUSD", Side::Buy, 1.0, "bot");
        registry.register(&intent, "ref-1").unwrap();
        registry
            .transition_by_reference("ref-1", OrderStatus::Submitted)
            .unwrap()
            .unwrap();
        registry
            .transition_by_reference("ref-1", OrderStatus::Filled)
            .unwrap()
            .unwrap();
        let result = registry.transition_by_reference("ref-1", OrderStatus::Acknowledged).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn purge_removes_only_trackers_past_retention() {
        let fixed = FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let clock: SharedClock = std::sync::Arc::new(fixed.clone());
        let registry = OrderRegistry::new(clock).with_retention(chrono::Duration::hours(1));
        let intent = OrderIntent::new("EURUSD", Side::Buy, 1.0, "bot");
        registry.register(&intent, "ref-1").unwrap();
        registry
            .transition_by_reference("ref-1", OrderStatus::Submitted)
            .unwrap()
            .unwrap();
        registry
            .transition_by_reference("ref-1", OrderStatus::Rejected)
            .unwrap()
            .unwrap();
        fixed.advance(chrono::Duration::hours(2));
        assert_eq!(registry.purge_stale(), 1);
        assert!(registry.get("ref-1").is_none());
    }
}
