//! Order intent and the order state machine (spec.md §3 "Order Intent",
//! "Order Tracker"; §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    CloseLong,
    CloseShort,
}

impl Side {
    /// CLOSE_LONG behaves like SELL and CLOSE_SHORT like BUY for
    /// price-direction purposes (spec.md §4.3).
    pub fn price_direction(&self) -> PriceDirection {
        match self {
            Side::Buy | Side::CloseShort => PriceDirection::Buy,
            Side::Sell | Side::CloseLong => PriceDirection::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// A unique, router-consumed intent to place an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub epic: Option<String>,
    pub order_type: OrderType,
    pub bot: String,
    pub reason_codes: Vec<String>,
}

impl OrderIntent {
    pub fn new(symbol: impl Into<String>, side: Side, size: f64, bot: impl Into<String>) -> Self {
        Self {
            intent_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            size,
            stop_loss: None,
            take_profit: None,
            epic: None,
            order_type: OrderType::Market,
            bot: bot.into(),
            reason_codes: Vec::new(),
        }
    }
}

/// Lifecycle states of a tracked order (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Acknowledged,
    Filled,
    Rejected,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    /// Whether `self -> next` is a legal transition per the table in
    /// spec.md §4.8. Terminal states have no legal outgoing transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        match self {
            Pending => matches!(next, Submitted | Rejected),
            Submitted => matches!(next, Acknowledged | Filled | Rejected | Expired),
            Acknowledged => matches!(next, Filled | Rejected | Cancelled),
            Filled | Rejected | Cancelled | Expired => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
}

/// Tracks one submitted intent through the order state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTracker {
    pub intent_id: Uuid,
    /// Client-generated idempotency token, unique per submission attempt.
    pub deal_reference: String,
    /// Broker-assigned identifier, set once acknowledged.
    pub deal_id: Option<String>,
    pub status: OrderStatus,
    pub history: Vec<StatusChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal order transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl OrderTracker {
    pub fn new(intent_id: Uuid, deal_reference: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            intent_id,
            deal_reference: deal_reference.into(),
            deal_id: None,
            status: OrderStatus::Pending,
            history: vec![StatusChange {
                status: OrderStatus::Pending,
                at,
            }],
        }
    }

    /// Applies a transition, ignoring (not panicking on) illegal
    /// out-of-order broker acks, per spec.md §5 ordering guarantees: "if
    /// broker acks out-of-order the registry ignores illegal transitions".
    pub fn transition(&mut self, next: OrderStatus, at: DateTime<Utc>) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.history.push(StatusChange { status: next, at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn legal_path_to_filled() {
        let mut tracker = OrderTracker::new(Uuid::new_v4(), "dr-1", t(0));
        tracker.transition(OrderStatus::Submitted, t(1)).unwrap();
        tracker.transition(OrderStatus::Acknowledged, t(2)).unwrap();
        tracker.transition(OrderStatus::Filled, t(3)).unwrap();
        assert_eq!(tracker.status, OrderStatus::Filled);
        assert_eq!(tracker.history.len(), 4);
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let mut tracker = OrderTracker::new(Uuid::new_v4(), "dr-2", t(0));
        tracker.transition(OrderStatus::Submitted, t(1)).unwrap();
        tracker.transition(OrderStatus::Rejected, t(2)).unwrap();
        let err = tracker.transition(OrderStatus::Filled, t(3)).unwrap_err();
        assert_eq!(err.from, OrderStatus::Rejected);
    }

    #[test]
    fn out_of_order_ack_after_fill_is_rejected_not_panicking() {
        let mut tracker = OrderTracker::new(Uuid::new_v4(), "dr-3", t(0));
        tracker.transition(OrderStatus::Submitted, t(1)).unwrap();
        tracker.transition(OrderStatus::Filled, t(2)).unwrap();
        assert!(tracker.transition(OrderStatus::Acknowledged, t(3)).is_err());
        assert_eq!(tracker.status, OrderStatus::Filled);
    }

    #[test]
    fn pending_cannot_jump_to_acknowledged() {
        let mut tracker = OrderTracker::new(Uuid::new_v4(), "dr-4", t(0));
        assert!(tracker.transition(OrderStatus::Acknowledged, t(1)).is_err());
    }
}
