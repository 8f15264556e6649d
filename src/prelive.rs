//! Prelive checker (spec.md §4.21): a sequenced readiness checklist run
//! before DEMO/LIVE trading is permitted to start. A pass sets
//! `prelive_passed` for the trading-gates clock (`execution::gates`); the
//! report expires after a configured max age, so a stale pass doesn't
//! silently keep gating LIVE trades open.

use crate::broker::BrokerAdapter;
use crate::clock::SharedClock;
use crate::domain::{OrderIntent, Side};
use crate::execution::risk_engine::{RiskCheckInput, RiskEngine};
use crate::config::TradingMode;
use crate::store::HistoricalBarStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreliveReport {
    pub checks: Vec<CheckResult>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl PreliveReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn age(&self, clock: &SharedClock) -> chrono::Duration {
        clock.now() - self.generated_at
    }
}

fn result(name: &str, passed: bool, message: impl Into<String>) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        passed,
        message: message.into(),
    }
}

/// Runs the full sequenced checklist once and returns a per-check
/// pass/fail report; never panics, a check that errors is recorded as a
/// failure rather than propagated.
pub async fn run_prelive_checklist(
    clock: &SharedClock,
    store: &dyn HistoricalBarStore,
    broker: &dyn BrokerAdapter,
    risk_engine: &RiskEngine,
    mode: TradingMode,
    probe_symbol: &str,
    probe_epic: &str,
    oversized_intent_size: f64,
) -> PreliveReport {
    let mut checks = Vec::new();

    // (a) historical store readable with at least one symbol having M1 bars.
    checks.push(match store.get_summary().await {
        Ok(summary) => {
            let has_m1 = summary.iter().any(|s| s.bar_counts.iter().any(|(tf, n)| *tf == crate::domain::Timeframe::M1 && *n > 0));
            result("historical_store_readable", has_m1, if has_m1 {
                "at least one symbol has M1 bars".to_string()
            } else {
                "no symbol has any M1 bars".to_string()
            })
        }
        Err(e) => result("historical_store_readable", false, format!("store error: {e}")),
    });

    // (b) a quote can be fetched from the broker.
    checks.push(match broker.get_market_details(probe_epic).await {
        Ok(details) => {
            let has_quote = details.bid.is_some() && details.offer.is_some();
            result("broker_quote_fetchable", has_quote, if has_quote {
                format!("fetched quote for {probe_epic}")
            } else {
                format!("{probe_epic} has no bid/offer")
            })
        }
        Err(e) => result("broker_quote_fetchable", false, format!("broker error: {e}")),
    });

    // (c) execution mode = DEMO.
    checks.push(result(
        "execution_mode_demo",
        mode == TradingMode::Demo,
        format!("mode is {mode:?}"),
    ));

    // (d) risk engine accepts a valid intent and rejects an oversized one.
    let valid_intent = OrderIntent::new(probe_symbol, Side::Buy, 1.0, "prelive_check");
    let valid_decision = risk_engine.evaluate(RiskCheckInput {
        intent: &valid_intent,
        dealing_rules: crate::backtest::broker_sim::DealingRules::default(),
        open_position_count: 0,
        account_balance: 100_000.0,
        today_realized_pnl: 0.0,
        existing_symbol_exposure: 0.0,
        mid_price: Some(1.0),
    });
    let oversized_intent = OrderIntent::new(probe_symbol, Side::Buy, oversized_intent_size, "prelive_check");
    let oversized_decision = risk_engine.evaluate(RiskCheckInput {
        intent: &oversized_intent,
        dealing_rules: crate::backtest::broker_sim::DealingRules::default(),
        open_position_count: 0,
        account_balance: 100_000.0,
        today_realized_pnl: 0.0,
        existing_symbol_exposure: 0.0,
        mid_price: Some(1.0),
    });
    let risk_ok = valid_decision.allowed && !oversized_decision.allowed;
    checks.push(result(
        "risk_engine_accepts_valid_rejects_oversized",
        risk_ok,
        if risk_ok {
            "valid intent accepted, oversized intent rejected".to_string()
        } else {
            format!(
                "valid_allowed={} oversized_allowed={}",
                valid_decision.allowed, oversized_decision.allowed
            )
        },
    ));

    // (e) broker credentials authenticate successfully.
    checks.push(match broker.verify_session().await {
        Ok(()) => result("broker_credentials_authenticate", true, "session verified"),
        Err(e) => result("broker_credentials_authenticate", false, format!("auth error: {e}")),
    });

    PreliveReport {
        checks,
        generated_at: clock.now(),
    }
}

pub struct PreliveGateClock {
    report: parking_lot::RwLock<Option<PreliveReport>>,
}

impl Default for PreliveGateClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PreliveGateClock {
    pub fn new() -> Self {
        Self {
            report: parking_lot::RwLock::new(None),
        }
    }

    pub fn record(&self, report: PreliveReport) {
        *self.report.write() = Some(report);
    }

    /// Age since the last passing report, if any was recorded and it
    /// passed. A never-passed or only-failed prelive state reports `None`,
    /// which the trading gates treat as "not fresh".
    pub fn age_since_pass(&self, clock: &SharedClock) -> Option<std::time::Duration> {
        let guard = self.report.read();
        let report = guard.as_ref()?;
        if !report.all_passed() {
            return None;
        }
        report.age(clock).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBrokerAdapter;
    use crate::clock::FixedClock;
    use crate::execution::risk_engine::RiskLimits;
    use crate::store::InMemoryBarStore;
    use crate::domain::{Bar, Timeframe};

    fn risk_engine() -> RiskEngine {
        RiskEngine::new(RiskLimits {
            max_position_size: 5.0,
            max_concurrent_positions: 5,
            max_daily_loss_pct: 5.0,
            max_trades_per_hour: 20,
            per_symbol_exposure_cap: 10_000.0,
            require_sl: false,
        })
    }

    #[tokio::test]
    async fn all_checks_pass_in_a_healthy_demo_setup() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let store = InMemoryBarStore::default();
        store
            .write_bars(
                vec![Bar::new("EURUSD", Timeframe::M1, "2024-01-01T00:00:00Z".parse().unwrap(), 1.1, 1.1, 1.1, 1.1, 1.0).unwrap()],
                "run-1",
            )
            .await
            .unwrap();
        let broker = SimBrokerAdapter::new();
        broker.set_mid_price("CS.D.EURUSD.CFD.IP", 1.1);
        let risk_engine = risk_engine();

        let report = run_prelive_checklist(
            &clock,
            &store,
            &broker,
            &risk_engine,
            TradingMode::Demo,
            "EURUSD",
            "CS.D.EURUSD.CFD.IP",
            100.0,
        )
        .await;

        assert!(report.all_passed(), "{:?}", report.checks);
    }

    #[tokio::test]
    async fn empty_store_fails_the_historical_data_check() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let store = InMemoryBarStore::default();
        let broker = SimBrokerAdapter::new();
        broker.set_mid_price("CS.D.EURUSD.CFD.IP", 1.1);
        let risk_engine = risk_engine();

        let report = run_prelive_checklist(
            &clock,
            &store,
            &broker,
            &risk_engine,
            TradingMode::Demo,
            "EURUSD",
            "CS.D.EURUSD.CFD.IP",
            100.0,
        )
        .await;

        let data_check = report.checks.iter().find(|c| c.name == "historical_store_readable").unwrap();
        assert!(!data_check.passed);
    }

    #[test]
    fn gate_clock_reports_no_age_if_last_report_failed() {
        let clock: SharedClock = Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()));
        let gate_clock = PreliveGateClock::new();
        gate_clock.record(PreliveReport {
            checks: vec![result("x", false, "failed")],
            generated_at: clock.now(),
        });
        assert!(gate_clock.age_since_pass(&clock).is_none());
    }

    #[test]
    fn gate_clock_reports_age_since_a_passing_report() {
        let fixed = FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let clock: SharedClock = Arc::new(fixed.clone());
        let gate_clock = PreliveGateClock::new();
        gate_clock.record(PreliveReport {
            checks: vec![result("x", true, "ok")],
            generated_at: clock.now(),
        });
        fixed.advance(chrono::Duration::seconds(30));
        let age = gate_clock.age_since_pass(&clock).unwrap();
        assert_eq!(age.as_secs(), 30);
    }
}
