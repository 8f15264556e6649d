//! Backtest runner CLI: loads CSV OHLCV bars into an in-memory store, runs
//! `BacktestEngine` over them with the requested strategy, and writes the
//! resulting metrics to an output JSON file (or stdout).
//!
//! # Usage
//!
//! ```bash
//! solat-engine/backtest-run \
//!   --symbol EURUSD --csv data/eurusd_m1.csv \
//!   --timeframe M1 --start 2024-01-01T00:00:00Z --end 2024-02-01T00:00:00Z \
//!   --warmup 20 --initial-cash 10000 --strategy hold \
//!   --artifacts-dir ./artifacts --output results.json
//! ```

use chrono::{DateTime, Utc};
use clap::Parser;
use solat_engine::backtest::broker_sim::{DealingRules, FeeSchedule, SimBrokerConfig};
use solat_engine::backtest::strategy::{HoldStrategy, Strategy};
use solat_engine::backtest::{BacktestConfig, BacktestEngine};
use solat_engine::domain::{Bar, Timeframe};
use solat_engine::execution::risk_engine::{RiskEngine, RiskLimits};
use solat_engine::store::InMemoryBarStore;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

fn parse_timeframe(s: &str) -> Result<Timeframe, String> {
    match s.to_uppercase().as_str() {
        "M1" => Ok(Timeframe::M1),
        "M5" => Ok(Timeframe::M5),
        "M15" => Ok(Timeframe::M15),
        "H1" => Ok(Timeframe::H1),
        "H4" => Ok(Timeframe::H4),
        other => Err(format!("unknown timeframe: {other}")),
    }
}

#[derive(Parser, Debug)]
#[command(name = "backtest-run")]
#[command(about = "Replay historical bars through a strategy and write backtest metrics")]
struct CliArgs {
    /// Symbol to backtest, e.g. EURUSD
    #[arg(long)]
    symbol: String,

    /// Path to a CSV file of timestamp,open,high,low,close,volume rows
    #[arg(long)]
    csv: String,

    /// Bar timeframe (M1, M5, M15, H1, H4)
    #[arg(long, value_parser = parse_timeframe, default_value = "M1")]
    timeframe: Timeframe,

    /// Backtest window start, RFC3339
    #[arg(long)]
    start: DateTime<Utc>,

    /// Backtest window end, RFC3339
    #[arg(long)]
    end: DateTime<Utc>,

    /// Number of leading bars to warm up indicators before trading starts
    #[arg(long, default_value_t = 20)]
    warmup: usize,

    /// Starting account cash
    #[arg(long = "initial-cash", default_value_t = 10_000.0)]
    initial_cash: f64,

    /// Strategy name to run
    #[arg(long, default_value = "hold")]
    strategy: String,

    /// Directory to write run artifacts (equity curve, trade log) to
    #[arg(long = "artifacts-dir", default_value = "./artifacts")]
    artifacts_dir: String,

    /// Write the metrics JSON here instead of stdout
    #[arg(long, short)]
    output: Option<String>,
}

/// CSV columns: timestamp,open,high,low,close,volume (header row required).
fn load_bars_csv(path: &str, symbol: &str, timeframe: Timeframe) -> Result<Vec<Bar>, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
    let mut bars = Vec::new();
    for (line_no, line) in contents.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() < 6 {
            return Err(format!("{path}:{}: expected 6 columns, found {}", line_no + 1, cols.len()));
        }
        let timestamp = DateTime::parse_from_rfc3339(cols[0])
            .map_err(|e| format!("{path}:{}: invalid timestamp: {e}", line_no + 1))?
            .with_timezone(&Utc);
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
        .map_err(|e| format!("{path}:{}: {e}", line_no + 1))?;
        bars.push(bar);
    }
    Ok(bars)
}

fn make_strategy(name: &str) -> Result<Arc<dyn Strategy>, String> {
    match name {
        "hold" => Ok(Arc::new(HoldStrategy::new(name))),
        other => Err(format!("unknown strategy: {other} (strategy math is supplied by the deployment, not this binary)")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let bars = match load_bars_csv(&args.csv, &args.symbol, args.timeframe) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error loading bars: {e}");
            return ExitCode::from(3);
        }
    };
    if bars.is_empty() {
        eprintln!("error: no bars loaded from {}", args.csv);
        return ExitCode::from(2);
    }

    let store = Arc::new(InMemoryBarStore::new());
    store.seed(bars);

    let strategy = match make_strategy(&args.strategy) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let risk_engine = RiskEngine::new(RiskLimits {
        max_position_size: 5.0,
        max_concurrent_positions: 5,
        max_daily_loss_pct: 10.0,
        max_trades_per_hour: 60,
        per_symbol_exposure_cap: 50_000.0,
        require_sl: false,
    });

    let engine = BacktestEngine::new(store, risk_engine, args.artifacts_dir.clone()).with_progress(Arc::new(
        |stage, done, total, message| {
            eprintln!("[{stage:?}] {done}/{total} {message}");
        },
    ));

    let config = BacktestConfig {
        symbols: vec![args.symbol.clone()],
        timeframe: args.timeframe,
        start: args.start,
        end: args.end,
        warmup: args.warmup,
        initial_cash: args.initial_cash,
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
            eprintln!("backtest failed: {e}");
            return ExitCode::from(3);
        }
    };

    let output_json = serde_json::json!({
        "run_id": result.run_id,
        "per_bot_metrics": result.per_bot_metrics,
        "combined_metrics": result.combined_metrics,
        "warnings": result.warnings,
    });

    match args.output {
        Some(path) => {
            if let Err(e) = fs::write(&path, serde_json::to_string_pretty(&output_json).unwrap_or_default()) {
                eprintln!("error writing {path}: {e}");
                return ExitCode::from(3);
            }
            println!("wrote results to {path}");
        }
        None => println!("{}", serde_json::to_string_pretty(&output_json).unwrap_or_default()),
    }

    if !result.warnings.is_empty() {
        eprintln!("{} warning(s) emitted during the run", result.warnings.len());
    }

    ExitCode::SUCCESS
}
