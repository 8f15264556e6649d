//! betterbot-backend composition root.
//!
//! Wires the leaves first (clock, bar store, broker adapter), then the
//! execution stack that depends on them (ledger, registry, kill switch,
//! router), then the loops that depend on the execution stack (market-data
//! controller, reconciliation, autopilot, scheduler). Nothing here is
//! constructed out of order or holds a back-pointer to something built
//! after it.

use solat_engine::autopilot::{self, Autopilot, AutopilotConfig};
use solat_engine::backtest::strategy::HoldStrategy;
use solat_engine::backtest::broker_sim::DealingRules;
use solat_engine::broker::{self, IgBrokerAdapter, SimBrokerAdapter};
use solat_engine::clock::{system_clock, SharedClock};
use solat_engine::config::{Settings, TradingMode};
use solat_engine::domain;
use solat_engine::execution::kill_switch::load_shared as load_kill_switch;
use solat_engine::execution::safety_guard::{CircuitBreaker, IdempotencyGuard};
use solat_engine::execution::{self, ExecutionLedger, ExecutionRouter, OrderRegistry, RiskEngine, RiskLimits, RouterDependencies};
use solat_engine::reconciliation::{self, PositionStore};
use solat_engine::scheduler::{AlwaysFresh, Scheduler};
use solat_engine::{allowlist, marketdata};
use std::sync::Arc;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::from_env();
    tracing::info!(mode = ?settings.runtime.mode, env = %settings.runtime.env, "starting betterbot-backend");

    let clock: SharedClock = system_clock();

    // --- leaves: storage, broker, caches ---
    // The historical bar store backs the backtest/combo-worker/prelive-check
    // binaries directly; the live daemon doesn't read or write it itself.
    let broker: Arc<dyn broker::BrokerAdapter> = match &settings.broker.api_key {
        Some(api_key) if settings.runtime.mode == TradingMode::Live => {
            let base_url = settings.broker.base_url_live.clone();
            Arc::new(IgBrokerAdapter::new(
                base_url,
                api_key.clone(),
                settings.broker.request_timeout,
                settings.broker.max_retries,
            )?)
        }
        _ => Arc::new(SimBrokerAdapter::new()),
    };

    let risk_engine = Arc::new(RiskEngine::new(RiskLimits {
        max_position_size: settings.risk.max_position_size,
        max_concurrent_positions: settings.risk.max_concurrent_positions,
        max_daily_loss_pct: settings.risk.max_daily_loss_pct,
        max_trades_per_hour: settings.risk.max_trades_per_hour,
        per_symbol_exposure_cap: settings.risk.per_symbol_exposure_cap,
        require_sl: settings.risk.require_sl,
    }));

    let allowlist_path = settings.runtime.data_dir.join("allowlist.json");
    let allowlist = Arc::new(allowlist::Allowlist::load(
        clock.clone(),
        allowlist_path,
        chrono::Duration::hours(24),
    )?);

    // --- execution stack ---
    let registry = Arc::new(OrderRegistry::new(clock.clone()));
    let ledger = Arc::new(ExecutionLedger::open(clock.clone(), settings.runtime.data_dir.join("ledger"))?);
    let kill_switch_path = settings.runtime.data_dir.join("kill_switch.json");
    let kill_switch = load_kill_switch(clock.clone(), kill_switch_path);
    let circuit_breaker = Arc::new(CircuitBreaker::new(clock.clone(), 5, chrono::Duration::minutes(5)));
    let idempotency = Arc::new(IdempotencyGuard::new());

    let router = Arc::new(ExecutionRouter::new(RouterDependencies {
        clock: clock.clone(),
        broker: broker.clone(),
        risk_engine: risk_engine.clone(),
        registry: registry.clone(),
        ledger: ledger.clone(),
        kill_switch: kill_switch.clone(),
        circuit_breaker,
        idempotency,
        allowlist: allowlist.clone(),
        live_gates: settings.live_gates.clone(),
        risk_settings: settings.risk,
        mode: settings.runtime.mode,
        account_id: settings.broker.account_id.clone().unwrap_or_default(),
    }));

    match broker.verify_session().await {
        Ok(()) => router.connect(),
        Err(e) => tracing::warn!(error = %e, "broker session verification failed at startup"),
    }

    if settings.runtime.mode == TradingMode::Demo {
        if let Err(reasons) = router.arm(true, false) {
            tracing::warn!(reasons = ?reasons, "router did not arm at startup");
        }
    }

    // --- loops that depend on the execution stack ---
    let mut controller = marketdata::MarketDataController::new(clock.clone());
    controller.on_stream_connected();

    let autopilot_router: Arc<dyn autopilot::AutopilotRouter> = Arc::new(RouterAutopilotBridge {
        router: router.clone(),
    });
    let autopilot = Arc::new(Autopilot::new(
        clock.clone(),
        allowlist.clone(),
        kill_switch.clone(),
        autopilot_router,
        AutopilotConfig {
            per_combo_cooldown_bars: 3,
            max_signals_per_60s: 10,
            default_size: settings.risk.max_position_size.min(1.0),
        },
    ));

    if settings.runtime.mode == TradingMode::Demo {
        let definitions = vec![autopilot::ComboDefinition {
            symbol: "EURUSD".to_string(),
            bot: "hold_bot".to_string(),
            timeframe: domain::Timeframe::M1,
            strategy: Arc::new(HoldStrategy::new("hold_bot")),
            warmup: 1,
        }];
        if let Err(reason) = autopilot.enable(settings.runtime.mode, router.is_armed(), definitions) {
            tracing::warn!(reason = %reason, "autopilot not enabled at startup");
        }
    }

    let scheduler = Arc::new(Scheduler::new(clock.clone(), allowlist.clone(), Arc::new(AlwaysFresh)));

    // --- background loops ---
    let position_store = Arc::new(PositionStore::new());
    let reconcile_handle = {
        let clock = clock.clone();
        let broker = broker.clone();
        let registry = registry.clone();
        let position_store = position_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = reconciliation::reconcile_once(&clock, broker.as_ref(), &position_store, &registry, None).await {
                    tracing::warn!(error = %e, "reconciliation cycle failed");
                }
            }
        })
    };

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                scheduler.run_nightly_if_due();
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    reconcile_handle.abort();
    scheduler_handle.abort();
    let _ = autopilot;
    Ok(())
}

/// Adapts `ExecutionRouter` to the autopilot's narrow routing trait by
/// assembling a minimal `RouteRequest` from the intent alone. A fuller
/// wiring would look up live mid price, dealing rules and account state
/// before routing; this bridge is the seam where that lookup belongs.
struct RouterAutopilotBridge {
    router: Arc<ExecutionRouter>,
}

#[async_trait::async_trait]
impl autopilot::AutopilotRouter for RouterAutopilotBridge {
    async fn route(&self, intent: domain::OrderIntent) -> Result<(), String> {
        let epic = intent.symbol.clone();
        let request = execution::RouteRequest {
            intent: &intent,
            epic: &epic,
            mid_price: None,
            dealing_rules: DealingRules::default(),
            open_position_count: 0,
            account_balance: 0.0,
            today_realized_pnl: 0.0,
            existing_symbol_exposure: 0.0,
            prelive_report_age: None,
        };
        self.router.route_intent(request).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solat_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
