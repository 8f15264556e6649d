//! Signal intent: the pure value produced by a strategy (spec.md §3
//! "Signal Intent").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn is_entry(&self) -> bool {
        !matches!(self, Direction::Hold)
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
            Direction::Hold => Direction::Hold,
        }
    }
}

/// Which side of the market an open position sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// True if a signal in the given direction would close this side
    /// (opposite direction) rather than extend it.
    pub fn is_opposed_by(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (PositionSide::Long, Direction::Sell) | (PositionSide::Short, Direction::Buy)
        )
    }

    pub fn from_entry_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Buy => Some(PositionSide::Long),
            Direction::Sell => Some(PositionSide::Short),
            Direction::Hold => None,
        }
    }
}

/// Produced by a strategy given a bar sequence and an optional current
/// position hint. Carries no lifecycle of its own; the router/backtest
/// engine turns it into an `OrderIntent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalIntent {
    pub direction: Direction,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: Option<f64>,
    pub reason_codes: Vec<String>,
    pub metadata: Option<HashMap<String, String>>,
}

impl SignalIntent {
    pub fn hold() -> Self {
        Self {
            direction: Direction::Hold,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            reason_codes: Vec::new(),
            metadata: None,
        }
    }

    pub fn entry(direction: Direction, reason_codes: Vec<String>) -> Self {
        Self {
            direction,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            reason_codes,
            metadata: None,
        }
    }

    pub fn with_sl_tp(mut self, sl: Option<f64>, tp: Option<f64>) -> Self {
        self.stop_loss = sl;
        self.take_profit = tp;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}
