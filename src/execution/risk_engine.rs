//! Execution risk engine (spec.md §4.9): a fixed, ordered sequence of
//! pre-trade checks applied to every intent, shared by the live execution
//! router and the backtest engine's sizing step.

use crate::backtest::broker_sim::DealingRules;
use crate::cache::WindowedCounter;
use crate::domain::OrderIntent;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_concurrent_positions: u32,
    pub max_daily_loss_pct: f64,
    pub max_trades_per_hour: u32,
    pub per_symbol_exposure_cap: f64,
    pub require_sl: bool,
}

#[derive(Debug, Clone)]
pub struct RiskCheckInput<'a> {
    pub intent: &'a OrderIntent,
    pub dealing_rules: DealingRules,
    pub open_position_count: u32,
    pub account_balance: f64,
    pub today_realized_pnl: f64,
    pub existing_symbol_exposure: f64,
    /// Current quoted mid price for the intent's symbol, required to value
    /// `size` as notional exposure. Per spec.md §9's resolved open question:
    /// a missing mid is a rejection, never a silently-substituted 1.0.
    pub mid_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub adjusted_size: f64,
    pub original_size: f64,
    pub reason_codes: Vec<String>,
    pub rejection_reason: Option<String>,
}

impl RiskDecision {
    fn rejected(original_size: f64, mut reason_codes: Vec<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        reason_codes.push(reason.clone());
        Self {
            allowed: false,
            adjusted_size: 0.0,
            original_size,
            reason_codes,
            rejection_reason: Some(reason),
        }
    }
}

/// Tracks trade-frequency state (check 7) across calls. One instance per
/// live execution context; the backtest engine can use a fresh instance per
/// run since backtests don't share wall-clock windows across runs.
pub struct RiskEngine {
    limits: RiskLimits,
    trades_this_hour: WindowedCounter,
    /// Guards `trades_this_hour.record_at` calls made with a caller-supplied
    /// instant (e.g. backtest bar time mapped onto a synthetic clock).
    last_recorded: Mutex<Option<Instant>>,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            trades_this_hour: WindowedCounter::new(Duration::from_secs(3600)),
            last_recorded: Mutex::new(None),
        }
    }

    /// Evaluates the intent against the ordered check sequence in spec.md
    /// §4.9. Each check either passes unchanged, adjusts the size (and
    /// records a reason code), or rejects outright.
    pub fn evaluate(&self, input: RiskCheckInput) -> RiskDecision {
        let mut reason_codes = Vec::new();
        let original_size = input.intent.size;
        let mut size = input.intent.size;

        // 1. Cap to max_position_size.
        if size > self.limits.max_position_size {
            size = self.limits.max_position_size;
            reason_codes.push("capped_to_max_position_size".to_string());
        }

        // 2. Cap to per-symbol max_size.
        if size > input.dealing_rules.max_size {
            size = input.dealing_rules.max_size;
            reason_codes.push("capped_to_dealing_rule_max_size".to_string());
        }

        // 3. Round to size_step.
        if input.dealing_rules.size_step > 0.0 {
            let steps = (size / input.dealing_rules.size_step).round();
            let snapped = steps * input.dealing_rules.size_step;
            if (snapped - size).abs() > 1e-12 {
                reason_codes.push("rounded_to_size_step".to_string());
            }
            size = snapped;
        }

        // 4. Reject if size < min_size.
        if size < input.dealing_rules.min_size {
            return RiskDecision::rejected(original_size, reason_codes, "size below minimum");
        }

        // 5. Reject if open position count >= max_concurrent_positions.
        if input.open_position_count >= self.limits.max_concurrent_positions {
            return RiskDecision::rejected(original_size, reason_codes, "max concurrent positions reached");
        }

        // 6. Reject if today's realized loss ratio exceeds the daily cap.
        if input.account_balance > 0.0 {
            let loss_pct = input.today_realized_pnl.min(0.0).abs() / input.account_balance * 100.0;
            if loss_pct >= self.limits.max_daily_loss_pct {
                return RiskDecision::rejected(original_size, reason_codes, "max daily loss reached");
            }
        }

        // 7. Reject if trades_in_last_hour >= max_trades_per_hour.
        if self.trades_this_hour.count_now() >= self.limits.max_trades_per_hour as usize {
            return RiskDecision::rejected(original_size, reason_codes, "max trades per hour reached");
        }

        // 8. Reject on per-symbol exposure cap breach. A missing mid price
        // is a hard rejection, never a silently-substituted 1.0.
        let mid = match input.mid_price {
            Some(mid) => mid,
            None => {
                return RiskDecision::rejected(
                    original_size,
                    reason_codes,
                    "no quoted mid price available to value exposure",
                );
            }
        };
        let proposed_notional = size * mid;
        if input.existing_symbol_exposure + proposed_notional > self.limits.per_symbol_exposure_cap {
            return RiskDecision::rejected(original_size, reason_codes, "per-symbol exposure cap exceeded");
        }

        // 9. Reject if require_sl and no SL provided.
        if self.limits.require_sl && input.intent.stop_loss.is_none() {
            return RiskDecision::rejected(original_size, reason_codes, "stop-loss is required");
        }

        RiskDecision {
            allowed: true,
            adjusted_size: size,
            original_size,
            reason_codes,
            rejection_reason: None,
        }
    }

    /// Records a successful submission so check 7 remains accurate; prunes
    /// are handled automatically by `WindowedCounter`'s window cutoff.
    pub fn record_trade(&self) {
        self.trades_this_hour.record();
        *self.last_recorded.lock() = Some(Instant::now());
    }

    /// Test/backtest hook: record a trade at an explicit instant rather than
    /// `Instant::now()`, so frequency limits can be exercised deterministically.
    pub fn record_trade_at(&self, at: Instant) {
        self.trades_this_hour.record_at(at);
        *self.last_recorded.lock() = Some(at);
    }

    pub fn trades_in_last_hour(&self) -> usize {
        self.trades_this_hour.count_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderIntent, Side};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 5.0,
            max_concurrent_positions: 3,
            max_daily_loss_pct: 5.0,
            max_trades_per_hour: 10,
            per_symbol_exposure_cap: 100_000.0,
            require_sl: true,
        }
    }

    fn rules() -> DealingRules {
        DealingRules {
            min_size: 0.01,
            max_size: 10.0,
            size_step: 0.01,
            step_epsilon: 1e-6,
        }
    }

    fn base_intent(size: f64) -> OrderIntent {
        let mut i = OrderIntent::new("EURUSD", Side::Buy, size, "bot");
        i.stop_loss = Some(1.0);
        i
    }

    #[test]
    fn caps_size_to_max_position_size() {
        let engine = RiskEngine::new(limits());
        let intent = base_intent(9.0);
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 0,
            account_balance: 10_000.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            mid_price: Some(1.1),
        });
        assert!(decision.allowed);
        assert_eq!(decision.adjusted_size, 5.0);
        assert!(decision.reason_codes.contains(&"capped_to_max_position_size".to_string()));
    }

    #[test]
    fn rejects_without_mid_price_rather_than_assuming_one() {
        let engine = RiskEngine::new(limits());
        let intent = base_intent(1.0);
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 0,
            account_balance: 10_000.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            mid_price: None,
        });
        assert!(!decision.allowed);
        assert!(decision.rejection_reason.unwrap().contains("mid price"));
    }

    #[test]
    fn rejects_when_max_concurrent_positions_reached() {
        let engine = RiskEngine::new(limits());
        let intent = base_intent(1.0);
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 3,
            account_balance: 10_000.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            mid_price: Some(1.1),
        });
        assert!(!decision.allowed);
    }

    #[test]
    fn rejects_when_daily_loss_limit_exceeded() {
        let engine = RiskEngine::new(limits());
        let intent = base_intent(1.0);
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 0,
            account_balance: 1_000.0,
            today_realized_pnl: -60.0,
            existing_symbol_exposure: 0.0,
            mid_price: Some(1.1),
        });
        assert!(!decision.allowed);
    }

    #[test]
    fn rejects_without_sl_when_required() {
        let engine = RiskEngine::new(limits());
        let mut intent = base_intent(1.0);
        intent.stop_loss = None;
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 0,
            account_balance: 10_000.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            mid_price: Some(1.1),
        });
        assert!(!decision.allowed);
    }

    #[test]
    fn rejects_beyond_trades_per_hour() {
        let engine = RiskEngine::new(limits());
        let now = Instant::now();
        for _ in 0..10 {
            engine.record_trade_at(now);
        }
        let intent = base_intent(1.0);
        let decision = engine.evaluate(RiskCheckInput {
            intent: &intent,
            dealing_rules: rules(),
            open_position_count: 0,
            account_balance: 10_000.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            mid_price: Some(1.1),
        });
        assert!(!decision.allowed);
    }
}
