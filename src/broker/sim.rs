//! In-memory broker simulator used by tests, the backtest engine's live-code
//! paths, and DEMO-mode dry runs that don't need a real connection.

use super::{
    AccountSummary, BrokerAdapter, BrokerPosition, DealStatus, Direction, MarketDetails, OrderAck,
    WorkingOrder,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

pub struct SimBrokerAdapter {
    inner: Mutex<SimState>,
    /// When set, the next N calls to `place_market_order` fail with this
    /// error; used to exercise retry/circuit-breaker paths in tests.
    fail_next_orders: Mutex<Vec<BrokerError>>,
}

struct SimState {
    positions: HashMap<String, BrokerPosition>,
    working_orders: HashMap<String, WorkingOrder>,
    mid_prices: HashMap<String, f64>,
    next_deal_id: u64,
}

impl Default for SimBrokerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBrokerAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimState {
                positions: HashMap::new(),
                working_orders: HashMap::new(),
                mid_prices: HashMap::new(),
                next_deal_id: 1,
            }),
            fail_next_orders: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mid_price(&self, epic: &str, price: f64) {
        self.inner.lock().mid_prices.insert(epic.to_string(), price);
    }

    pub fn queue_failure(&self, err: BrokerError) {
        self.fail_next_orders.lock().push(err);
    }

    pub fn position_count(&self) -> usize {
        self.inner.lock().positions.len()
    }
}

#[async_trait]
impl BrokerAdapter for SimBrokerAdapter {
    async fn verify_session(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<AccountSummary>, BrokerError> {
        Ok(vec![AccountSummary {
            account_id: "SIM".to_string(),
            account_type: "DEMO".to_string(),
            balance: 100_000.0,
            available: 100_000.0,
            currency: "USD".to_string(),
        }])
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.inner.lock().positions.values().cloned().collect())
    }

    async fn place_market_order(
        &self,
        epic: &str,
        direction: Direction,
        size: f64,
        stop_level: Option<f64>,
        limit_level: Option<f64>,
        deal_reference: &str,
    ) -> Result<OrderAck, BrokerError> {
        if let Some(err) = self.fail_next_orders.lock().pop() {
            return Err(err);
        }
        let mut state = self.inner.lock();
        let entry_level = *state.mid_prices.get(epic).unwrap_or(&1.0);
        let deal_id = format!("SIM-{}", state.next_deal_id);
        state.next_deal_id += 1;
        state.positions.insert(
            deal_id.clone(),
            BrokerPosition {
                deal_id: deal_id.clone(),
                epic: epic.to_string(),
                direction,
                size,
                entry_level,
                stop_level,
                limit_level,
            },
        );
        Ok(OrderAck {
            deal_reference: deal_reference.to_string(),
            deal_id: Some(deal_id),
            deal_status: Some(DealStatus::Accepted),
            status_raw: "ACCEPTED".to_string(),
            rejection_reason: None,
            raw: serde_json::json!({"dealStatus": "ACCEPTED"}),
        })
    }

    async fn close_position(
        &self,
        deal_id: &str,
        _direction: Direction,
        _size: f64,
    ) -> Result<OrderAck, BrokerError> {
        let mut state = self.inner.lock();
        state.positions.remove(deal_id);
        Ok(OrderAck {
            deal_reference: format!("close-{deal_id}"),
            deal_id: Some(deal_id.to_string()),
            deal_status: Some(DealStatus::Accepted),
            status_raw: "ACCEPTED".to_string(),
            rejection_reason: None,
            raw: serde_json::json!({"dealStatus": "ACCEPTED"}),
        })
    }

    async fn get_working_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError> {
        Ok(self.inner.lock().working_orders.values().cloned().collect())
    }

    async fn cancel_working_order(&self, deal_id: &str) -> Result<(), BrokerError> {
        self.inner.lock().working_orders.remove(deal_id);
        Ok(())
    }

    async fn get_market_details(&self, epic: &str) -> Result<MarketDetails, BrokerError> {
        let state = self.inner.lock();
        let mid = state.mid_prices.get(epic).copied();
        Ok(MarketDetails {
            epic: epic.to_string(),
            bid: mid.map(|m| m - 0.0001),
            offer: mid.map(|m| m + 0.0001),
            tradeable: mid.is_some(),
            min_deal_size: 0.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placing_order_opens_a_position() {
        let sim = SimBrokerAdapter::new();
        sim.set_mid_price("CS.D.EURUSD.CFD.IP", 1.0850);
        let ack = sim
            .place_market_order("CS.D.EURUSD.CFD.IP", Direction::Buy, 1.0, None, None, "ref-1")
            .await
            .unwrap();
        assert_eq!(ack.status_raw, "ACCEPTED");
        assert_eq!(sim.position_count(), 1);
    }

    #[tokio::test]
    async fn queued_failure_is_returned_once() {
        let sim = SimBrokerAdapter::new();
        sim.queue_failure(BrokerError::Transport("down".into()));
        let result = sim
            .place_market_order("EPIC", Direction::Buy, 1.0, None, None, "ref-2")
            .await;
        assert!(result.is_err());
        let ok = sim
            .place_market_order("EPIC", Direction::Buy, 1.0, None, None, "ref-3")
            .await;
        assert!(ok.is_ok());
    }
}
