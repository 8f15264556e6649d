//! Standalone prelive checklist runner (spec.md §4.21): runs the same
//! sequenced readiness checks the live daemon gates LIVE trading on, prints
//! the report, and exits non-zero if any check failed — for use in CI or as
//! a pre-flight step before flipping `MODE=LIVE`.

use clap::Parser;
use solat_engine::broker::{BrokerAdapter, IgBrokerAdapter, SimBrokerAdapter};
use solat_engine::clock::system_clock;
use solat_engine::config::{Settings, TradingMode};
use solat_engine::execution::risk_engine::{RiskEngine, RiskLimits};
use solat_engine::prelive::run_prelive_checklist;
use solat_engine::store::InMemoryBarStore;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "prelive-check")]
#[command(about = "Run the readiness checklist LIVE trading is gated on and exit non-zero on failure")]
struct CliArgs {
    /// Symbol to probe for tradeable market data
    #[arg(long, env = "PRELIVE_PROBE_SYMBOL", default_value = "EURUSD")]
    probe_symbol: String,

    /// Broker epic to probe
    #[arg(long, env = "PRELIVE_PROBE_EPIC", default_value = "CS.D.EURUSD.CFD.IP")]
    probe_epic: String,

    /// Order size used to confirm the risk engine rejects an oversized order
    #[arg(long, env = "PRELIVE_OVERSIZED_SIZE", default_value_t = 1_000_000.0)]
    oversized_size: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::from_env();
    let clock = system_clock();

    // A standalone run has no historical store or broker session wired in
    // from the live daemon process; it builds its own against the same
    // configured broker so the check reflects what the daemon would see.
    let store = InMemoryBarStore::new();
    let broker: Arc<dyn BrokerAdapter> = match &settings.broker.api_key {
        Some(api_key) => {
            let base_url = match settings.runtime.mode {
                TradingMode::Live => settings.broker.base_url_live.clone(),
                TradingMode::Demo => settings.broker.base_url_demo.clone(),
            };
            match IgBrokerAdapter::new(base_url, api_key.clone(), settings.broker.request_timeout, settings.broker.max_retries) {
                Ok(adapter) => Arc::new(adapter),
                Err(e) => {
                    eprintln!("error constructing broker adapter: {e}");
                    return ExitCode::from(2);
                }
            }
        }
        None => Arc::new(SimBrokerAdapter::new()),
    };

    let risk_engine = RiskEngine::new(RiskLimits {
        max_position_size: settings.risk.max_position_size,
        max_concurrent_positions: settings.risk.max_concurrent_positions,
        max_daily_loss_pct: settings.risk.max_daily_loss_pct,
        max_trades_per_hour: settings.risk.max_trades_per_hour,
        per_symbol_exposure_cap: settings.risk.per_symbol_exposure_cap,
        require_sl: settings.risk.require_sl,
    });

    let args = CliArgs::parse();

    let report = run_prelive_checklist(
        &clock,
        &store,
        broker.as_ref(),
        &risk_engine,
        settings.runtime.mode,
        &args.probe_symbol,
        &args.probe_epic,
        args.oversized_size,
    )
    .await;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize report: {e}"),
    }

    if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        eprintln!("prelive checklist failed: {} of {} checks passed", report.checks.iter().filter(|c| c.passed).count(), report.checks.len());
        ExitCode::from(1)
    }
}
