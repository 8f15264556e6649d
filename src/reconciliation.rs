// =============================================================================
// Reconciliation loop — compare internal position state against the broker
// =============================================================================
//
// SAFETY POLICY: this module logs and records drift for any discrepancy it
// finds but never automatically cancels orders or closes positions. Resolving
// drift is the kill switch's job (spec.md §4.12) or a human operator's, never
// this loop's.
// =============================================================================

use crate::broker::{BrokerAdapter, BrokerPosition};
use crate::clock::SharedClock;
use crate::event_bus::{event_bus, Event, EventType};
use crate::execution::registry::OrderRegistry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Canonical, broker-shape-independent view of one open position
/// (spec.md §4.15 step 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub deal_id: String,
    pub epic: String,
    pub size: f64,
}

impl From<&BrokerPosition> for PositionView {
    fn from(p: &BrokerPosition) -> Self {
        Self {
            deal_id: p.deal_id.clone(),
            epic: p.epic.clone(),
            size: p.size,
        }
    }
}

/// The local mirror of "what positions does the broker currently hold",
/// mutated only by `reconcile_once`. Distinct from `OrderRegistry`, which
/// tracks order lifecycle/idempotency, not a point-in-time snapshot of
/// broker-side positions.
#[derive(Default)]
pub struct PositionStore {
    positions: RwLock<HashMap<String, PositionView>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<PositionView> {
        self.positions.read().values().cloned().collect()
    }

    fn overwrite(&self, positions: &[PositionView]) {
        let mut store = self.positions.write();
        store.clear();
        for position in positions {
            store.insert(position.deal_id.clone(), position.clone());
        }
    }

    fn local_ids(&self) -> HashSet<String> {
        self.positions.read().keys().cloned().collect()
    }

    fn get(&self, deal_id: &str) -> Option<PositionView> {
        self.positions.read().get(deal_id).cloned()
    }
}

/// Size mismatch beyond which two positions sharing a deal id are considered
/// drifted (spec.md §4.15 step 3).
const SIZE_MISMATCH_EPSILON: f64 = 0.0001;

/// Summary of a single reconciliation pass (spec.md §4.15).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub positions_matched: u32,
    /// Broker-reported deal ids with no matching local position.
    pub missing_locally: Vec<String>,
    /// Locally tracked deal ids the broker no longer reports.
    pub missing_on_broker: Vec<String>,
    /// Deal ids present on both sides whose size differs by more than
    /// `SIZE_MISMATCH_EPSILON`.
    pub size_mismatches: Vec<String>,
    pub balance_drift: bool,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileResult {
    fn has_drift(&self) -> bool {
        !self.missing_locally.is_empty() || !self.missing_on_broker.is_empty() || !self.size_mismatches.is_empty() || self.balance_drift
    }
}

/// Runs one reconciliation cycle against `broker`: fetches its positions,
/// diffs them against `store`, overwrites `store` with broker truth, and
/// emits the corresponding events (spec.md §4.15). `registry` is consulted
/// only for a diagnostic log line, never mutated and never the basis for the
/// drift computation itself — the position store is.
pub async fn reconcile_once(
    clock: &SharedClock,
    broker: &dyn BrokerAdapter,
    store: &PositionStore,
    registry: &OrderRegistry,
    expected_balance: Option<f64>,
) -> anyhow::Result<ReconcileResult> {
    let now = clock.now();
    info!(timestamp = %now.to_rfc3339(), "reconciliation cycle started");

    let broker_positions = match broker.list_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!(error = %e, "reconciliation: failed to fetch broker positions");
            return Err(anyhow::anyhow!("reconcile: failed to fetch broker positions: {e}"));
        }
    };
    debug!(broker_position_count = broker_positions.len(), "broker positions fetched");

    // Step 2: canonical PositionView list.
    let broker_views: Vec<PositionView> = broker_positions.iter().map(PositionView::from).collect();
    let broker_ids: HashSet<String> = broker_views.iter().map(|p| p.deal_id.clone()).collect();
    let local_ids = store.local_ids();

    // Step 3: drift relative to the local position store.
    let missing_locally: Vec<String> = broker_ids.difference(&local_ids).cloned().collect();
    let missing_on_broker: Vec<String> = local_ids.difference(&broker_ids).cloned().collect();
    let size_mismatches: Vec<String> = broker_ids
        .intersection(&local_ids)
        .filter(|deal_id| {
            let broker_size = broker_views.iter().find(|p| &p.deal_id == *deal_id).map(|p| p.size);
            let local_size = store.get(deal_id).map(|p| p.size);
            match (broker_size, local_size) {
                (Some(b), Some(l)) => (b - l).abs() > SIZE_MISMATCH_EPSILON,
                _ => false,
            }
        })
        .cloned()
        .collect();

    for deal_id in &missing_on_broker {
        warn!(deal_id = %deal_id, "locally tracked position no longer reported by broker — possible drift");
    }
    for deal_id in &missing_locally {
        warn!(deal_id = %deal_id, "broker reports a position with no local record — possible drift");
    }
    for deal_id in &size_mismatches {
        warn!(deal_id = %deal_id, "local and broker position sizes disagree beyond tolerance");
    }

    let open_order_deal_ids: HashSet<String> = registry.open_deal_ids().into_iter().collect();
    let orders_without_broker_position = open_order_deal_ids.difference(&broker_ids).count();
    if orders_without_broker_position > 0 {
        debug!(
            count = orders_without_broker_position,
            "order registry has open orders not reflected in broker positions (informational only)"
        );
    }

    let balance_drift = match expected_balance {
        Some(expected) => match broker.list_accounts().await {
            Ok(accounts) => accounts
                .first()
                .map(|a| (a.balance - expected).abs() > 0.01)
                .unwrap_or(false),
            Err(_) => false,
        },
        None => false,
    };

    // Step 4: overwrite the local store with broker truth. Broker is always
    // the source of truth; local state never wins a conflict.
    store.overwrite(&broker_views);

    let matched = broker_ids.intersection(&local_ids).count() as u32;
    let result = ReconcileResult {
        positions_matched: matched,
        missing_locally,
        missing_on_broker,
        size_mismatches,
        balance_drift,
        timestamp: now,
    };

    // Step 5: emit positions_updated and, if drift, reconciliation_warning.
    if result.has_drift() {
        event_bus().publish(
            Event::new(EventType::ReconciliationWarning)
                .with("missing_locally", serde_json::json!(result.missing_locally))
                .with("missing_on_broker", serde_json::json!(result.missing_on_broker))
                .with("size_mismatches", serde_json::json!(result.size_mismatches))
                .with("balance_drift", balance_drift),
        );
    }
    event_bus().publish(Event::new(EventType::PositionsUpdated).with("positions_matched", matched as i64));

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBrokerAdapter;
    use crate::clock::FixedClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn clean_state_reconciles_without_drift() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        let store = PositionStore::new();
        let registry = OrderRegistry::new(clock.clone());
        let result = reconcile_once(&clock, &broker, &store, &registry, None).await.unwrap();
        assert!(result.missing_locally.is_empty());
        assert!(result.missing_on_broker.is_empty());
        assert!(result.size_mismatches.is_empty());
        assert!(!result.balance_drift);
    }

    #[tokio::test]
    async fn broker_position_with_no_local_record_is_missing_locally() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        broker.set_mid_price("CS.D.EURUSD.CFD.IP", 1.1);
        broker
            .place_market_order("CS.D.EURUSD.CFD.IP", crate::broker::Direction::Buy, 1.0, None, None, "ref-1")
            .await
            .unwrap();
        let store = PositionStore::new();
        let registry = OrderRegistry::new(clock.clone());
        let result = reconcile_once(&clock, &broker, &store, &registry, None).await.unwrap();
        assert_eq!(result.missing_locally.len(), 1);
    }

    #[tokio::test]
    async fn local_position_matching_broker_counts_as_matched() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        broker.set_mid_price("CS.D.EURUSD.CFD.IP", 1.1);
        let ack = broker
            .place_market_order("CS.D.EURUSD.CFD.IP", crate::broker::Direction::Buy, 1.0, None, None, "ref-1")
            .await
            .unwrap();
        let deal_id = ack.deal_id.clone().unwrap();
        let store = PositionStore::new();
        store.overwrite(&[PositionView {
            deal_id: deal_id.clone(),
            epic: "CS.D.EURUSD.CFD.IP".to_string(),
            size: 1.0,
        }]);
        let registry = OrderRegistry::new(clock.clone());
        let result = reconcile_once(&clock, &broker, &store, &registry, None).await.unwrap();
        assert_eq!(result.positions_matched, 1);
        assert!(result.missing_locally.is_empty());
        assert!(result.missing_on_broker.is_empty());
    }

    #[tokio::test]
    async fn local_position_absent_from_broker_is_missing_on_broker() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        let store = PositionStore::new();
        store.overwrite(&[PositionView {
            deal_id: "DEAL-STALE".to_string(),
            epic: "CS.D.EURUSD.CFD.IP".to_string(),
            size: 1.0,
        }]);
        let registry = OrderRegistry::new(clock.clone());
        let result = reconcile_once(&clock, &broker, &store, &registry, None).await.unwrap();
        assert_eq!(result.missing_on_broker, vec!["DEAL-STALE".to_string()]);
    }

    #[tokio::test]
    async fn size_mismatch_is_detected_and_store_is_overwritten_with_broker_truth() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        broker.set_mid_price("CS.D.EURUSD.CFD.IP", 1.1);
        let ack = broker
            .place_market_order("CS.D.EURUSD.CFD.IP", crate::broker::Direction::Buy, 2.0, None, None, "ref-1")
            .await
            .unwrap();
        let deal_id = ack.deal_id.clone().unwrap();
        let store = PositionStore::new();
        // Local store believes the size is 1.0; broker actually reports 2.0.
        store.overwrite(&[PositionView {
            deal_id: deal_id.clone(),
            epic: "CS.D.EURUSD.CFD.IP".to_string(),
            size: 1.0,
        }]);
        let registry = OrderRegistry::new(clock.clone());
        let result = reconcile_once(&clock, &broker, &store, &registry, None).await.unwrap();
        assert_eq!(result.size_mismatches, vec![deal_id.clone()]);

        // Step 4: the store must now reflect broker truth, not the stale local value.
        let overwritten = store.get(&deal_id).unwrap();
        assert!((overwritten.size - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn balance_drift_detected_against_expected_balance() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let broker = SimBrokerAdapter::new();
        let store = PositionStore::new();
        let registry = OrderRegistry::new(clock.clone());
        // SimBrokerAdapter reports a fixed 100_000.0 balance.
        let result = reconcile_once(&clock, &broker, &store, &registry, Some(50_000.0)).await.unwrap();
        assert!(result.balance_drift);
    }
}
