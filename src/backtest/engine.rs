//! Bar-driven backtest engine (spec.md §4.6): a stage-sequencing,
//! progress-reporting sequential-symbol bar-replay loop.

use crate::backtest::artifacts::{run_id, ArtifactWriter, RunManifest, ENGINE_VERSION};
use crate::backtest::broker_sim::{BacktestBroker, DealingRules, FillOutcome, SimBrokerConfig};
use crate::backtest::metrics::{compute_metrics, PerformanceMetrics, BARS_PER_DAY_1M};
use crate::backtest::portfolio::Portfolio;
use crate::backtest::strategy::Strategy;
use crate::domain::{Bar, ExitReason, OrderType, Position, PositionSide, Side, Timeframe};
use crate::execution::risk_engine::{RiskCheckInput, RiskEngine};
use crate::store::HistoricalBarStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub warmup: usize,
    pub initial_cash: f64,
    pub dealing_rules: DealingRules,
    pub broker: SimBrokerConfig,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressStage {
    Loading,
    Replaying,
    WritingArtifacts,
    Done,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressStage, usize, usize, &str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BacktestError {
    #[error("symbol {symbol} has only {available} bars, below warmup requirement {warmup}")]
    InsufficientBars {
        symbol: String,
        available: usize,
        warmup: usize,
    },
    #[error("store error: {0}")]
    Store(#[from] crate::error::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct BacktestResult {
    pub run_id: String,
    pub per_bot_metrics: HashMap<String, PerformanceMetrics>,
    pub combined_metrics: PerformanceMetrics,
    pub warnings: Vec<String>,
}

pub struct BacktestEngine {
    store: Arc<dyn HistoricalBarStore>,
    risk_engine: RiskEngine,
    artifacts_root: std::path::PathBuf,
    progress: Option<ProgressCallback>,
}

impl BacktestEngine {
    pub fn new(store: Arc<dyn HistoricalBarStore>, risk_engine: RiskEngine, artifacts_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store,
            risk_engine,
            artifacts_root: artifacts_root.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    fn report(&self, stage: ProgressStage, done: usize, total: usize, message: &str) {
        if let Some(cb) = &self.progress {
            cb(stage, done, total, message);
        }
    }

    /// Runs one backtest over `config.symbols` (sequentially) and
    /// `strategies` (the "bots"), writing artefacts under
    /// `{artifacts_root}/runs/{run_id}/` and returning the combined result.
    pub async fn run(
        &self,
        config: &BacktestConfig,
        strategies: &[Arc<dyn Strategy>],
    ) -> Result<BacktestResult, BacktestError> {
        let config_json = serde_json::to_string(&serde_json::json!({
            "symbols": config.symbols,
            "timeframe": config.timeframe.as_str(),
            "start": config.start,
            "end": config.end,
            "warmup": config.warmup,
            "initial_cash": config.initial_cash,
        }))
        .unwrap_or_default();
        let run_id = run_id(&config_json);

        self.report(ProgressStage::Loading, 0, config.symbols.len(), "loading bars");

        let mut portfolio = Portfolio::new(config.initial_cash);
        let mut warnings = Vec::new();
        let mut per_bot_trades: HashMap<String, Vec<crate::domain::TradeRecord>> = HashMap::new();
        let mut all_orders: Vec<serde_json::Value> = Vec::new();
        let broker = BacktestBroker::new(config.broker);

        for (idx, symbol) in config.symbols.iter().enumerate() {
            self.report(ProgressStage::Replaying, idx, config.symbols.len(), symbol);

            let bars = self
                .store
                .read_bars(symbol, config.timeframe, Some(config.start), Some(config.end), None)
                .await?;

            if bars.len() < config.warmup {
                return Err(BacktestError::InsufficientBars {
                    symbol: symbol.clone(),
                    available: bars.len(),
                    warmup: config.warmup,
                });
            }

            self.replay_symbol(
                symbol,
                &bars,
                config,
                strategies,
                &mut portfolio,
                &broker,
                &mut all_orders,
                &mut per_bot_trades,
            );
        }

        warnings.extend(broker.warnings());

        self.report(ProgressStage::WritingArtifacts, 0, 1, "writing artefacts");

        let combined_metrics = compute_metrics(portfolio.equity_curve(), portfolio.closed_trades(), BARS_PER_DAY_1M);
        let mut per_bot_metrics = HashMap::new();
        for (bot, trades) in &per_bot_trades {
            per_bot_metrics.insert(bot.clone(), compute_metrics(portfolio.equity_curve(), trades, BARS_PER_DAY_1M));
        }

        let writer = ArtifactWriter::new(&self.artifacts_root, &run_id)?;
        writer.write_manifest(&RunManifest {
            run_id: run_id.clone(),
            config: serde_json::from_str(&config_json).unwrap_or_default(),
            start: config.start,
            end: config.end,
            engine_version: ENGINE_VERSION.to_string(),
        })?;
        writer.write_equity_curve(portfolio.equity_curve())?;
        writer.write_trades(portfolio.closed_trades())?;
        writer.write_orders(&all_orders)?;
        writer.write_metrics(&per_bot_metrics, &combined_metrics)?;
        writer.write_warnings(&warnings)?;

        self.report(ProgressStage::Done, 1, 1, "complete");

        Ok(BacktestResult {
            run_id,
            per_bot_metrics,
            combined_metrics,
            warnings,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn replay_symbol(
        &self,
        symbol: &str,
        bars: &[Bar],
        config: &BacktestConfig,
        strategies: &[Arc<dyn Strategy>],
        portfolio: &mut Portfolio,
        broker: &BacktestBroker,
        all_orders: &mut Vec<serde_json::Value>,
        per_bot_trades: &mut HashMap<String, Vec<crate::domain::TradeRecord>>,
    ) {
        let mut prev_ts: Option<DateTime<Utc>> = None;

        for i in config.warmup..bars.len() {
            let bar = &bars[i];
            if let Some(prev) = prev_ts {
                debug_assert!(bar.timestamp > prev, "bar timestamps must be strictly increasing");
            }
            prev_ts = Some(bar.timestamp);

            let mut prices = HashMap::new();
            prices.insert(symbol.to_string(), bar.close);

            // 1. Update prices.
            portfolio.update_prices(&prices);

            // 2. Check SL/TP exits.
            let exit_trades = portfolio.check_exits(&prices, bar.timestamp, 0.0);
            for trade in exit_trades {
                per_bot_trades.entry(trade.bot.clone()).or_default().push(trade);
            }

            // 3. Bars-held bookkeeping.
            portfolio.increment_bars_held();

            // 4. Strategy invocation per bot.
            let history = &bars[0..=i];
            for strategy in strategies {
                let bot = strategy.name();
                let current_position = portfolio.position(symbol, bot).map(|p| p.side);
                let signal = strategy.generate_signal(history, current_position);

                if !signal.direction.is_entry() {
                    continue;
                }

                if let Some(existing) = current_position {
                    if existing.is_opposed_by(signal.direction) {
                        let side = match existing {
                            PositionSide::Long => Side::CloseLong,
                            PositionSide::Short => Side::CloseShort,
                        };
                        if let FillOutcome::Filled(fill) = broker.simulate(symbol, side, 1.0, bar.close) {
                            if let Some(trade) = portfolio.close_position(
                                symbol,
                                bot,
                                fill.price,
                                bar.timestamp,
                                ExitReason::SignalReversal,
                                fill.fees,
                            ) {
                                all_orders.push(order_record(symbol, bot, side, fill.price, fill.size, OrderType::Market));
                                per_bot_trades.entry(bot.to_string()).or_default().push(trade);
                            }
                        }
                    }
                    continue;
                }

                // No open position: size via the risk engine, then enter.
                let mut intent = crate::domain::OrderIntent::new(
                    symbol,
                    match signal.direction {
                        crate::domain::Direction::Buy => Side::Buy,
                        crate::domain::Direction::Sell => Side::Sell,
                        crate::domain::Direction::Hold => unreachable!("filtered above"),
                    },
                    config.dealing_rules.max_size.min(1.0),
                    bot,
                );
                intent.stop_loss = signal.stop_loss;
                intent.take_profit = signal.take_profit;

                let decision = self.risk_engine.evaluate(RiskCheckInput {
                    intent: &intent,
                    dealing_rules: config.dealing_rules,
                    open_position_count: portfolio.open_position_count() as u32,
                    account_balance: portfolio.equity(),
                    today_realized_pnl: portfolio.realized_pnl(),
                    existing_symbol_exposure: 0.0,
                    mid_price: Some(bar.close),
                });
                if !decision.allowed {
                    continue;
                }

                let side = match signal.direction {
                    crate::domain::Direction::Buy => Side::Buy,
                    crate::domain::Direction::Sell => Side::Sell,
                    crate::domain::Direction::Hold => unreachable!("filtered above"),
                };
                if let FillOutcome::Filled(fill) = broker.simulate(symbol, side, decision.adjusted_size, bar.close) {
                    self.risk_engine.record_trade();
                    let position_side = PositionSide::from_entry_direction(signal.direction)
                        .expect("entry direction implies a position side");
                    portfolio.open_position(
                        bot,
                        Position::open(
                            symbol,
                            bot,
                            position_side,
                            fill.size,
                            fill.price,
                            bar.timestamp,
                            signal.stop_loss,
                            signal.take_profit,
                        ),
                    );
                    all_orders.push(order_record(symbol, bot, side, fill.price, fill.size, OrderType::Market));
                }
            }

            // 5. Record equity point.
            portfolio.record_equity_point(bar.timestamp);
        }
    }
}

fn order_record(symbol: &str, bot: &str, side: Side, price: f64, size: f64, order_type: OrderType) -> serde_json::Value {
    serde_json::json!({
        "symbol": symbol,
        "bot": bot,
        "side": format!("{side:?}"),
        "price": price,
        "size": size,
        "order_type": format!("{order_type:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::broker_sim::FeeSchedule;
    use crate::backtest::strategy::Strategy;
    use crate::domain::{Direction, SignalIntent};
    use crate::execution::risk_engine::RiskLimits;
    use crate::store::InMemoryBarStore;

    struct AlwaysBuy;
    impl Strategy for AlwaysBuy {
        fn name(&self) -> &str {
            "always_buy"
        }
        fn generate_signal(&self, bars: &[Bar], current_position: Option<PositionSide>) -> SignalIntent {
            if current_position.is_some() {
                return SignalIntent::hold();
            }
            if bars.len() % 10 == 0 {
                SignalIntent::entry(Direction::Buy, vec!["test".to_string()])
                    .with_sl_tp(Some(bars.last().unwrap().close - 0.01), Some(bars.last().unwrap().close + 0.01))
            } else {
                SignalIntent::hold()
            }
        }
    }

    fn fixture_bars(n: usize) -> Vec<Bar> {
        let start: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        (0..n)
            .map(|i| {
                let price = 1.10 + (i as f64 * 0.0001);
                Bar::new(
                    "EURUSD",
                    Timeframe::M1,
                    start + chrono::Duration::minutes(i as i64),
                    price,
                    price + 0.0005,
                    price - 0.0005,
                    price,
                    1000.0,
                )
                .unwrap()
            })
            .collect()
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            symbols: vec!["EURUSD".to_string()],
            timeframe: Timeframe::M1,
            start: "2024-01-01T00:00:00Z".parse().unwrap(),
            end: "2024-01-01T10:00:00Z".parse().unwrap(),
            warmup: 5,
            initial_cash: 10_000.0,
            dealing_rules: DealingRules {
                min_size: 0.01,
                max_size: 1.0,
                size_step: 0.01,
                step_epsilon: 1e-6,
            },
            broker: SimBrokerConfig {
                spread: 0.0001,
                slippage: 0.00002,
                fees: FeeSchedule {
                    per_trade_flat: 0.1,
                    per_lot: 0.0,
                    percentage: 0.0,
                },
                dealing_rules: DealingRules {
                    min_size: 0.01,
                    max_size: 1.0,
                    size_step: 0.01,
                    step_epsilon: 1e-6,
                },
            },
        }
    }

    fn risk_limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 1.0,
            max_concurrent_positions: 5,
            max_daily_loss_pct: 50.0,
            max_trades_per_hour: 1000,
            per_symbol_exposure_cap: 1_000_000.0,
            require_sl: false,
        }
    }

    #[tokio::test]
    async fn same_config_bars_seed_produce_identical_artefacts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBarStore::new());
        store.seed(fixture_bars(100));
        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(AlwaysBuy)];

        let engine1 = BacktestEngine::new(store.clone(), RiskEngine::new(risk_limits()), tmp.path());
        let result1 = engine1.run(&config(), &strategies).await.unwrap();

        let tmp2 = tempfile::tempdir().unwrap();
        let engine2 = BacktestEngine::new(store, RiskEngine::new(risk_limits()), tmp2.path());
        let result2 = engine2.run(&config(), &strategies).await.unwrap();

        assert_eq!(result1.run_id, result2.run_id);
        let trades1 = std::fs::read_to_string(tmp.path().join("runs").join(&result1.run_id).join("trades.jsonl")).unwrap();
        let trades2 = std::fs::read_to_string(tmp2.path().join("runs").join(&result2.run_id).join("trades.jsonl")).unwrap();
        assert_eq!(trades1, trades2);
    }

    #[tokio::test]
    async fn rejects_run_below_warmup_bar_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBarStore::new());
        store.seed(fixture_bars(2));
        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(AlwaysBuy)];
        let engine = BacktestEngine::new(store, RiskEngine::new(risk_limits()), tmp.path());
        let mut cfg = config();
        cfg.warmup = 5;
        let err = engine.run(&cfg, &strategies).await.unwrap_err();
        assert!(matches!(err, BacktestError::InsufficientBars { .. }));
    }
}
