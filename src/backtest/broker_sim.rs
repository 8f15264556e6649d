//! Deterministic backtest fill simulator (spec.md §4.3).
//!
//! Distinct from `broker::sim::SimBrokerAdapter` (which fakes the *live*
//! `BrokerAdapter` interface for router tests): this component computes a
//! fill price and fee purely as a function of the bar close plus configured
//! spread/slippage/fee/dealing-rule parameters, with no async/network
//! surface at all — the backtest engine calls it synchronously in the bar
//! loop.

use crate::domain::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DealingRules {
    pub min_size: f64,
    pub max_size: f64,
    pub size_step: f64,
    /// Rounding tolerance: a size within this distance of a step boundary is
    /// snapped to it rather than rejected.
    pub step_epsilon: f64,
}

impl Default for DealingRules {
    fn default() -> Self {
        Self {
            min_size: 0.01,
            max_size: 100.0,
            size_step: 0.01,
            step_epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub per_trade_flat: f64,
    pub per_lot: f64,
    pub percentage: f64,
}

impl FeeSchedule {
    pub fn compute(&self, size: f64, notional: f64) -> f64 {
        self.per_trade_flat + self.per_lot * size + (self.percentage / 100.0) * notional
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimBrokerConfig {
    pub spread: f64,
    pub slippage: f64,
    pub fees: FeeSchedule,
    pub dealing_rules: DealingRules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    BelowMinSize,
    AboveMaxSize,
    SizeNotOnStep,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub size: f64,
    pub fees: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FillOutcome {
    Filled(Fill),
    Rejected { reason: RejectionReason, detail: String },
}

/// A single backtest broker simulator, one per symbol (dealing rules and
/// spread/slippage are expected to vary by symbol in a real deployment).
pub struct BacktestBroker {
    config: SimBrokerConfig,
    history: parking_lot::Mutex<Vec<(String, FillOutcome)>>,
    warnings: parking_lot::Mutex<Vec<String>>,
}

impl BacktestBroker {
    pub fn new(config: SimBrokerConfig) -> Self {
        Self {
            config,
            history: parking_lot::Mutex::new(Vec::new()),
            warnings: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// No partial fills in version 1: an order is either fully filled or
    /// fully rejected (spec.md §4.3).
    pub fn simulate(&self, symbol: &str, side: Side, size: f64, bar_close: f64) -> FillOutcome {
        let outcome = self.simulate_inner(side, size, bar_close);
        self.history.lock().push((symbol.to_string(), outcome.clone()));
        outcome
    }

    fn simulate_inner(&self, side: Side, size: f64, bar_close: f64) -> FillOutcome {
        let rules = self.config.dealing_rules;
        let rounded_size = match self.round_to_step(size, rules) {
            Some(snapped) => snapped,
            None => {
                return FillOutcome::Rejected {
                    reason: RejectionReason::SizeNotOnStep,
                    detail: format!("size {size} is not within step_epsilon of a size_step {} multiple", rules.size_step),
                };
            }
        };
        if rounded_size < rules.min_size {
            return FillOutcome::Rejected {
                reason: RejectionReason::BelowMinSize,
                detail: format!("size {rounded_size} below min_size {}", rules.min_size),
            };
        }
        if rounded_size > rules.max_size {
            return FillOutcome::Rejected {
                reason: RejectionReason::AboveMaxSize,
                detail: format!("size {rounded_size} above max_size {}", rules.max_size),
            };
        }

        let half_spread = self.config.spread / 2.0;
        let price = match side.price_direction() {
            crate::domain::order::PriceDirection::Buy => {
                bar_close + half_spread + self.config.slippage
            }
            crate::domain::order::PriceDirection::Sell => {
                bar_close - half_spread - self.config.slippage
            }
        };
        let notional = price * rounded_size;
        let fees = self.config.fees.compute(rounded_size, notional);
        FillOutcome::Filled(Fill {
            price,
            size: rounded_size,
            fees,
        })
    }

    /// Snaps to the nearest step if within `step_epsilon` of one; returns
    /// `None` if `size` sits off every step boundary, which the caller turns
    /// into a `SizeNotOnStep` rejection.
    fn round_to_step(&self, size: f64, rules: DealingRules) -> Option<f64> {
        if rules.size_step <= 0.0 {
            return Some(size);
        }
        let steps = (size / rules.size_step).round();
        let snapped = steps * rules.size_step;
        if (snapped - size).abs() <= rules.step_epsilon {
            Some(snapped)
        } else {
            None
        }
    }

    pub fn history(&self) -> Vec<(String, FillOutcome)> {
        self.history.lock().clone()
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.warnings.lock().push(message.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}
