//! Autopilot (spec.md §4.19): binds finalized bar events to allowlisted
//! strategy combos and, on an entry signal, routes an `OrderIntent`.
//! Enabled only in DEMO mode with an armed, non-kill-switched execution
//! path and a non-empty allowlist — the same fail-closed posture as the
//! trading gates (spec.md §4.10), just applied to whether the autopilot
//! runs at all rather than to a single order.

use crate::allowlist::Allowlist;
use crate::backtest::strategy::Strategy;
use crate::clock::SharedClock;
use crate::config::TradingMode;
use crate::domain::{Bar, Direction, OrderIntent, Side, Timeframe};
use crate::event_bus::{event_bus, Event, EventType};
use crate::execution::kill_switch::KillSwitch;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// The narrow routing surface the autopilot needs. Kept separate from
/// `ExecutionRouter::route_intent`'s full `RouteRequest` (market context,
/// dealing rules) which only the live order-entry path can assemble —
/// a production wiring adapts `ExecutionRouter` to this trait.
#[async_trait]
pub trait AutopilotRouter: Send + Sync {
    async fn route(&self, intent: OrderIntent) -> Result<(), String>;
}

const ERROR_RING_CAPACITY: usize = 50;
const BUFFER_PADDING: usize = 50;
const SIGNAL_RATE_WINDOW_SECS: i64 = 60;

struct ComboSlot {
    bot: String,
    symbol: String,
    timeframe: Timeframe,
    strategy: Arc<dyn Strategy>,
    warmup: usize,
    buffer: VecDeque<Bar>,
    cooldown: u32,
}

fn combo_key(symbol: &str, bot: &str, timeframe: Timeframe) -> String {
    format!("{symbol}:{bot}:{}", timeframe.as_str())
}

/// One (symbol, bot, timeframe, strategy) definition offered to `enable`;
/// only definitions whose (symbol, bot) pair is allowlisted are instantiated.
pub struct ComboDefinition {
    pub symbol: String,
    pub bot: String,
    pub timeframe: Timeframe,
    pub strategy: Arc<dyn Strategy>,
    pub warmup: usize,
}

pub struct AutopilotConfig {
    pub per_combo_cooldown_bars: u32,
    pub max_signals_per_60s: usize,
    pub default_size: f64,
}

pub struct Autopilot {
    clock: SharedClock,
    allowlist: Arc<Allowlist>,
    kill_switch: Arc<KillSwitch>,
    router: Arc<dyn AutopilotRouter>,
    config: AutopilotConfig,
    combos: parking_lot::RwLock<HashMap<String, ComboSlot>>,
    signal_timestamps: parking_lot::Mutex<VecDeque<chrono::DateTime<chrono::Utc>>>,
    errors: parking_lot::Mutex<VecDeque<String>>,
    enabled: AtomicBool,
}

impl Autopilot {
    pub fn new(
        clock: SharedClock,
        allowlist: Arc<Allowlist>,
        kill_switch: Arc<KillSwitch>,
        router: Arc<dyn AutopilotRouter>,
        config: AutopilotConfig,
    ) -> Self {
        Self {
            clock,
            allowlist,
            kill_switch,
            router,
            config,
            combos: parking_lot::RwLock::new(HashMap::new()),
            signal_timestamps: parking_lot::Mutex::new(VecDeque::new()),
            errors: parking_lot::Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enables the autopilot and instantiates one buffered combo slot per
    /// `definitions` entry that is also present in the allowlist. Fails
    /// closed: any unmet precondition leaves the autopilot disabled.
    pub fn enable(&self, mode: TradingMode, armed: bool, definitions: Vec<ComboDefinition>) -> Result<(), String> {
        if mode != TradingMode::Demo {
            return Err("autopilot can only be enabled in DEMO mode".to_string());
        }
        if !armed {
            return Err("execution router is not armed".to_string());
        }
        if self.kill_switch.is_triggered() {
            return Err("kill switch is triggered".to_string());
        }
        if self.allowlist.entries().is_empty() {
            return Err("allowlist is empty".to_string());
        }

        let mut combos = self.combos.write();
        combos.clear();
        for def in definitions {
            if !self.allowlist.is_allowed(&def.symbol, &def.bot) {
                continue;
            }
            let key = combo_key(&def.symbol, &def.bot, def.timeframe);
            combos.insert(
                key,
                ComboSlot {
                    bot: def.bot,
                    symbol: def.symbol,
                    timeframe: def.timeframe,
                    strategy: def.strategy,
                    warmup: def.warmup,
                    buffer: VecDeque::with_capacity(def.warmup + BUFFER_PADDING),
                    cooldown: 0,
                },
            );
        }
        drop(combos);

        self.enabled.store(true, Ordering::SeqCst);
        event_bus().publish(Event::new(EventType::AutopilotEnabled));
        Ok(())
    }

    /// Disables the autopilot and unsubscribes its combo slots; a caller
    /// feeding bars in from an event-bus subscription drops that
    /// subscription separately (spec.md §5 "Autopilot disable unsubscribes
    /// from the bus").
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.combos.write().clear();
        event_bus().publish(Event::new(EventType::AutopilotDisabled));
    }

    fn record_error(&self, message: String) {
        warn!(error = %message, "autopilot strategy error");
        let mut errors = self.errors.lock();
        errors.push_back(message);
        if errors.len() > ERROR_RING_CAPACITY {
            errors.pop_front();
        }
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.errors.lock().iter().cloned().collect()
    }

    fn signal_rate_exceeded(&self) -> bool {
        let now = self.clock.now();
        let mut timestamps = self.signal_timestamps.lock();
        let cutoff = now - chrono::Duration::seconds(SIGNAL_RATE_WINDOW_SECS);
        while matches!(timestamps.front(), Some(t) if *t < cutoff) {
            timestamps.pop_front();
        }
        timestamps.len() >= self.config.max_signals_per_60s
    }

    fn record_signal(&self) {
        self.signal_timestamps.lock().push_back(self.clock.now());
    }

    /// Feeds one finalized bar through every matching combo. A no-op if
    /// disabled or the kill switch has tripped since the autopilot was
    /// enabled (checked on every bar, not just at `enable` time).
    pub async fn on_bar(&self, bar: Bar) {
        if !self.is_enabled() || self.kill_switch.is_triggered() {
            return;
        }

        let mut to_route: Vec<(OrderIntent, String)> = Vec::new();
        {
            let mut combos = self.combos.write();
            for slot in combos.values_mut() {
                if slot.symbol != bar.symbol || slot.timeframe != bar.timeframe {
                    continue;
                }

                slot.buffer.push_back(bar.clone());
                while slot.buffer.len() > slot.warmup + BUFFER_PADDING {
                    slot.buffer.pop_front();
                }

                slot.cooldown += 1;
                if slot.cooldown < self.config.per_combo_cooldown_bars {
                    continue;
                }
                if self.signal_rate_exceeded() {
                    continue;
                }

                let bars: Vec<Bar> = slot.buffer.iter().cloned().collect();
                let strategy = slot.strategy.clone();
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| strategy.generate_signal(&bars, None)));
                let signal = match outcome {
                    Ok(signal) => signal,
                    Err(_) => {
                        self.record_error(format!("{}:{} strategy panicked", slot.symbol, slot.bot));
                        continue;
                    }
                };

                if signal.direction.is_entry() {
                    slot.cooldown = 0;
                    self.record_signal();
                    let side = match signal.direction {
                        Direction::Buy => Side::Buy,
                        Direction::Sell => Side::Sell,
                        Direction::Hold => continue,
                    };
                    let mut intent = OrderIntent::new(&slot.symbol, side, self.config.default_size, &slot.bot);
                    intent.stop_loss = signal.stop_loss;
                    intent.take_profit = signal.take_profit;
                    intent.reason_codes = signal.reason_codes.clone();
                    event_bus().publish(
                        Event::new(EventType::AutopilotSignal)
                            .with("symbol", slot.symbol.clone())
                            .with("bot", slot.bot.clone()),
                    );
                    to_route.push((intent, combo_key(&slot.symbol, &slot.bot, slot.timeframe)));
                }
            }
        }

        for (intent, key) in to_route {
            if let Err(e) = self.router.route(intent).await {
                self.record_error(format!("{key}: route failed: {e}"));
            }
        }
    }
}
