//! Environment configuration.
//!
//! `dotenv().ok()` then `env::var(...).unwrap_or_else(...).parse().unwrap_or(default)`
//! for every setting, grouped the way spec.md §6 groups the reserved env var names.

use std::env;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Demo,
    Live,
}

impl TradingMode {
    fn from_env(key: &str) -> Self {
        match env::var(key).unwrap_or_default().to_uppercase().as_str() {
            "LIVE" => TradingMode::Live,
            _ => TradingMode::Demo,
        }
    }
}

/// Top-level mode/runtime settings (spec.md §6 "Mode" group).
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub mode: TradingMode,
    pub env: String,
    pub host: String,
    pub port: u16,
    pub data_dir: std::path::PathBuf,
    pub log_level: String,
}

/// Broker connection settings (spec.md §6 "Broker" group).
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub account_id: Option<String>,
    pub account_type: String,
    pub base_url_demo: String,
    pub base_url_live: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
}

/// LIVE-gate settings (spec.md §6 "Live gates" group, consumed by
/// `execution::gates::TradingGates`).
#[derive(Debug, Clone)]
pub struct LiveGateSettings {
    pub live_trading_enabled: bool,
    pub live_enable_token: Option<String>,
    pub live_account_id: Option<String>,
    pub live_max_order_size: Option<f64>,
    pub live_confirmation_ttl_s: u64,
    pub live_prelive_max_age_s: u64,
}

/// Risk limit settings (spec.md §6 "Risk" group).
#[derive(Debug, Clone, Copy)]
pub struct RiskSettings {
    pub max_position_size: f64,
    pub max_concurrent_positions: u32,
    pub max_daily_loss_pct: f64,
    pub max_trades_per_hour: u32,
    pub per_symbol_exposure_cap: f64,
    pub require_sl: bool,
    pub close_on_kill_switch: bool,
    pub require_arm_confirmation: bool,
    /// Whether a DEMO-mode intent is allowed to actually reach the broker;
    /// when false, DEMO intents are recorded as `Pending` and never
    /// submitted (spec.md §4.14 step 8).
    pub demo_arm_enabled: bool,
    /// Hard sanity cap on DEMO order size, independent of `max_position_size`
    /// (spec.md §4.10 "Size validator").
    pub demo_max_size: f64,
}

/// Market-data settings (spec.md §6 "Market data" group).
#[derive(Debug, Clone)]
pub struct MarketDataSettings {
    pub mode: String,
    pub poll_interval_ms: u64,
    pub max_quotes_per_sec: f64,
    pub max_subscriptions: u32,
    pub persist_bars: bool,
    pub stale_threshold_s: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub broker: BrokerSettings,
    pub live_gates: LiveGateSettings,
    pub risk: RiskSettings,
    pub market_data: MarketDataSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let runtime = RuntimeSettings {
            mode: TradingMode::from_env("MODE"),
            env: env_string("ENV", "development"),
            host: env_string("HOST", "127.0.0.1"),
            port: env_parse("PORT", 8080u16),
            data_dir: std::path::PathBuf::from(env_string("DATA_DIR", "./data")),
            log_level: env_string("LOG_LEVEL", "info"),
        };

        let broker = BrokerSettings {
            api_key: env::var("IG_API_KEY").ok(),
            username: env::var("IG_USERNAME").ok(),
            password: env::var("IG_PASSWORD").ok(),
            account_id: env::var("IG_ACCOUNT_ID").ok(),
            account_type: env_string("IG_ACC_TYPE", "CFD"),
            base_url_demo: env_string(
                "IG_BASE_URL_DEMO",
                "https://demo-api.ig.com/gateway/deal",
            ),
            base_url_live: env_string("IG_BASE_URL_LIVE", "https://api.ig.com/gateway/deal"),
            request_timeout: Duration::from_secs_f64(env_parse("IG_REQUEST_TIMEOUT_S", 10.0)),
            max_retries: env_parse("IG_MAX_RETRIES", 3u32),
            rate_limit_rps: env_parse("IG_RATE_LIMIT_RPS", 10.0),
            rate_limit_burst: env_parse("IG_RATE_LIMIT_BURST", 20u32),
        };

        let live_gates = LiveGateSettings {
            live_trading_enabled: env_bool("LIVE_TRADING_ENABLED", false),
            live_enable_token: env::var("LIVE_ENABLE_TOKEN").ok(),
            live_account_id: env::var("LIVE_ACCOUNT_ID").ok(),
            live_max_order_size: env::var("LIVE_MAX_ORDER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok()),
            live_confirmation_ttl_s: env_parse("LIVE_CONFIRMATION_TTL_S", 300u64),
            live_prelive_max_age_s: env_parse("LIVE_PRELIVE_MAX_AGE_S", 3600u64),
        };

        let risk = RiskSettings {
            max_position_size: env_parse("MAX_POSITION_SIZE", 1.0),
            max_concurrent_positions: env_parse("MAX_CONCURRENT_POSITIONS", 5u32),
            max_daily_loss_pct: env_parse("MAX_DAILY_LOSS_PCT", 5.0),
            max_trades_per_hour: env_parse("MAX_TRADES_PER_HOUR", 20u32),
            per_symbol_exposure_cap: env_parse("PER_SYMBOL_EXPOSURE_CAP", 10_000.0),
            require_sl: env_bool("REQUIRE_SL", true),
            close_on_kill_switch: env_bool("CLOSE_ON_KILL_SWITCH", true),
            require_arm_confirmation: env_bool("REQUIRE_ARM_CONFIRMATION", true),
            demo_arm_enabled: env_bool("DEMO_ARM_ENABLED", false),
            demo_max_size: env_parse("DEMO_MAX_SIZE", 1.0),
        };

        let market_data = MarketDataSettings {
            mode: env_string("MARKET_DATA_MODE", "stream"),
            poll_interval_ms: env_parse("MARKET_DATA_POLL_INTERVAL_MS", 2_000u64),
            max_quotes_per_sec: env_parse("MARKET_DATA_MAX_QUOTES_PER_SEC", 5.0),
            max_subscriptions: env_parse("MARKET_DATA_MAX_SUBSCRIPTIONS", 40u32),
            persist_bars: env_bool("MARKET_DATA_PERSIST_BARS", true),
            stale_threshold_s: env_parse("MARKET_DATA_STALE_THRESHOLD_S", 60u64),
        };

        Self {
            runtime,
            broker,
            live_gates,
            risk,
            market_data,
        }
    }

    /// Risk parameters the LIVE gate requires to be explicitly configured
    /// (spec.md §4.11 gate 3). Mirrors `Settings.get_live_risk_blockers` in
    /// the source this was distilled from.
    pub fn live_risk_blockers(&self) -> Vec<String> {
        let mut blockers = Vec::new();
        if self.risk.max_position_size <= 0.0 {
            blockers.push("MAX_POSITION_SIZE is not configured".to_string());
        }
        if self.risk.max_daily_loss_pct <= 0.0 {
            blockers.push("MAX_DAILY_LOSS_PCT is not configured".to_string());
        }
        if self.live_gates.live_max_order_size.is_none() {
            blockers.push("LIVE_MAX_ORDER_SIZE is not configured".to_string());
        }
        blockers
    }
}
