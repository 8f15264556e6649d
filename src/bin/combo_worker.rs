//! Combo worker: runs exactly one sweep combo to completion and prints its
//! metrics as JSON on stdout, then exits. Spawned as an isolated OS process
//! by `sweep::runner::ProcessComboExecutor` — process isolation means one
//! combo's panic or resource leak can never affect another's run (spec.md
//! §4.7, §5 "processes, not threads").
//!
//! # Usage
//!
//! ```bash
//! solat-engine/combo-worker --combo '{"bot":"hold","symbol":"EURUSD","timeframe":"M1","start":"2024-01-01T00:00:00Z","end":"2024-02-01T00:00:00Z"}'
//! ```
//!
//! Bars are read from `$BAR_DATA_DIR/<symbol>_<timeframe>.csv` (default
//! `./data`), the same CSV layout `backtest-run` reads directly.

use clap::Parser;
use solat_engine::backtest::broker_sim::{DealingRules, FeeSchedule, SimBrokerConfig};
use solat_engine::backtest::strategy::{HoldStrategy, Strategy};
use solat_engine::backtest::{BacktestConfig, BacktestEngine};
use solat_engine::domain::Bar;
use solat_engine::execution::risk_engine::{RiskEngine, RiskLimits};
use solat_engine::store::InMemoryBarStore;
use solat_engine::sweep::ComboSpec;
use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "combo-worker")]
#[command(about = "Run exactly one sweep combo to completion and print its metrics as JSON")]
struct CliArgs {
    /// Combo specification as a JSON object (bot, symbol, timeframe, start, end)
    #[arg(long)]
    combo: String,
}

fn parse_combo_arg(raw: &str) -> Result<ComboSpec, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid --combo JSON: {e}"))
}

fn bar_data_path(symbol: &str, timeframe_str: &str) -> std::path::PathBuf {
    let dir = env::var("BAR_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    std::path::Path::new(&dir).join(format!("{symbol}_{timeframe_str}.csv"))
}

/// Same `timestamp,open,high,low,close,volume` CSV layout `backtest-run` reads.
fn load_bars_csv(path: &std::path::Path, symbol: &str, timeframe: solat_engine::domain::Timeframe) -> Result<Vec<Bar>, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    let mut bars = Vec::new();
    for (line_no, line) in contents.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() < 6 {
            return Err(format!("{}:{}: expected 6 columns, found {}", path.display(), line_no + 1, cols.len()));
        }
        let timestamp = chrono::DateTime::parse_from_rfc3339(cols[0])
            .map_err(|e| format!("{}:{}: invalid timestamp: {e}", path.display(), line_no + 1))?
            .with_timezone(&chrono::Utc);
        let parse_f = |s: &str| -> Result<f64, String> { s.parse().map_err(|_| format!("invalid numeric value: {s}")) };
        let bar = Bar::new(
            symbol,
            timeframe,
            timestamp,
            parse_f(cols[1])?,
            parse_f(cols[2])?,
            parse_f(cols[3])?,
            parse_f(cols[4])?,
            parse_f(cols[5])?,
        )
        .map_err(|e| format!("{}:{}: {e}", path.display(), line_no + 1))?;
        bars.push(bar);
    }
    Ok(bars)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let combo = match parse_combo_arg(&args.combo) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let bar_path = bar_data_path(&combo.symbol, combo.timeframe.as_str());
    let bars = match load_bars_csv(&bar_path, &combo.symbol, combo.timeframe) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error loading bars: {e}");
            return ExitCode::from(3);
        }
    };
    if bars.is_empty() {
        eprintln!("error: no bars loaded from {}", bar_path.display());
        return ExitCode::from(2);
    }

    let store = Arc::new(InMemoryBarStore::new());
    store.seed(bars);

    // Strategy math is out of this crate's scope; the worker only knows
    // how to run the placeholder hold strategy under the requested bot
    // name, the same restriction `backtest-run` applies.
    let strategy: Arc<dyn Strategy> = Arc::new(HoldStrategy::new(combo.bot.clone()));

    let risk_engine = RiskEngine::new(RiskLimits {
        max_position_size: env_f64("MAX_POSITION_SIZE", 5.0),
        max_concurrent_positions: 5,
        max_daily_loss_pct: 10.0,
        max_trades_per_hour: 60,
        per_symbol_exposure_cap: 50_000.0,
        require_sl: false,
    });

    let artifacts_dir = env::var("ARTIFACTS_DIR").unwrap_or_else(|_| "./artifacts".to_string());
    let engine = BacktestEngine::new(store, risk_engine, artifacts_dir);

    let config = BacktestConfig {
        symbols: vec![combo.symbol.clone()],
        timeframe: combo.timeframe,
        start: combo.start,
        end: combo.end,
        warmup: env_usize("WARMUP", 20),
        initial_cash: env_f64("INITIAL_CASH", 10_000.0),
        dealing_rules: DealingRules::default(),
        broker: SimBrokerConfig {
            spread: 0.0002,
            slippage: 0.0001,
            fees: FeeSchedule {
                per_trade_flat: 0.0,
                per_lot: 0.0,
                percentage: 0.0,
            },
            dealing_rules: DealingRules::default(),
        },
    };

    let result = match engine.run(&config, &[strategy]).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("combo failed: {e}");
            return ExitCode::from(3);
        }
    };

    match serde_json::to_string(&result.combined_metrics) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to serialize metrics: {e}");
            ExitCode::from(3)
        }
    }
}
