//! Execution router (spec.md §4.14): the single place an `OrderIntent`
//! passes through the idempotency guard, the allowlist, the trading gates,
//! the risk engine and finally the broker adapter, recording every step to
//! the ledger and the event bus. Every other execution submodule exists to
//! serve this one.

use crate::broker::{BrokerAdapter, BrokerPosition, Direction};
use crate::clock::SharedClock;
use crate::config::{LiveGateSettings, RiskSettings, TradingMode};
use crate::domain::{OrderIntent, OrderStatus, Side};
use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::event_bus::{event_bus, Event, EventType};
use crate::execution::gates::{AccountVerification, GateCheckInput, TradingGates, UiConfirmation};
use crate::execution::kill_switch::KillSwitch;
use crate::execution::ledger::ExecutionLedger;
use crate::execution::registry::OrderRegistry;
use crate::execution::risk_engine::{RiskCheckInput, RiskEngine};
use crate::execution::safety_guard::{validate_demo_size, CircuitBreaker, IdempotencyGuard};
use parking_lot::RwLock;
use std::sync::Arc;

/// Returns `true` if `symbol` is currently allowed to trade. Kept as a
/// trait object so the router doesn't hard-depend on the allowlist's
/// persistence format.
pub trait AllowlistCheck: Send + Sync {
    fn is_allowed(&self, symbol: &str, bot: &str) -> bool;
}

pub struct AlwaysAllowed;
impl AllowlistCheck for AlwaysAllowed {
    fn is_allowed(&self, _symbol: &str, _bot: &str) -> bool {
        true
    }
}

pub struct RouterDependencies {
    pub clock: SharedClock,
    pub broker: Arc<dyn BrokerAdapter>,
    pub risk_engine: Arc<RiskEngine>,
    pub registry: Arc<OrderRegistry>,
    pub ledger: Arc<ExecutionLedger>,
    pub kill_switch: Arc<KillSwitch>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub allowlist: Arc<dyn AllowlistCheck>,
    pub live_gates: LiveGateSettings,
    pub risk_settings: RiskSettings,
    pub mode: TradingMode,
    pub account_id: String,
}

pub struct RouteRequest<'a> {
    pub intent: &'a OrderIntent,
    pub epic: &'a str,
    pub mid_price: Option<f64>,
    pub dealing_rules: crate::backtest::broker_sim::DealingRules,
    pub open_position_count: u32,
    pub account_balance: f64,
    pub today_realized_pnl: f64,
    pub existing_symbol_exposure: f64,
    pub prelive_report_age: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub deal_reference: String,
    pub deal_id: Option<String>,
    pub status: OrderStatus,
}

/// Router-owned arming state, separate from `TradingGates`: the trading
/// gates decide whether LIVE conditions are satisfied on every call, while
/// this is the operator's standing decision to let *any* order (DEMO or
/// LIVE) reach the broker at all (spec.md §4.14 steps 8-10).
struct ArmState {
    armed: bool,
    connected: bool,
    account_verification: Option<AccountVerification>,
    ui_confirmation: Option<UiConfirmation>,
    ui_confirmed_at: Option<chrono::DateTime<chrono::Utc>>,
    balance: Option<f64>,
    balance_refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
    fills_since_refresh: u32,
}

/// Balance is considered stale after this long without a refresh
/// (spec.md §4.14 step 6).
fn balance_stale_after() -> chrono::Duration {
    chrono::Duration::minutes(5)
}
/// Balance is force-refreshed after this many fills even if not yet stale
/// by time (spec.md §4.14 step 12).
const BALANCE_REFRESH_EVERY_N_FILLS: u32 = 10;

pub struct ExecutionRouter {
    deps: RouterDependencies,
    state: RwLock<ArmState>,
}

impl ExecutionRouter {
    pub fn new(deps: RouterDependencies) -> Self {
        Self {
            deps,
            state: RwLock::new(ArmState {
                armed: false,
                connected: false,
                account_verification: None,
                ui_confirmation: None,
                ui_confirmed_at: None,
                balance: None,
                balance_refreshed_at: None,
                fills_since_refresh: 0,
            }),
        }
    }

    /// Arms the router. `confirm` stands for the operator's phrase + prelive
    /// checkmarks; `live_mode` controls whether the call also requires an
    /// existing UI confirmation record (LIVE must always have one; DEMO does
    /// not). Returns the list of unmet requirements on failure, leaving the
    /// router disarmed.
    pub fn arm(&self, confirm: bool, live_mode: bool) -> Result<(), Vec<String>> {
        let mut unmet = Vec::new();
        if !confirm {
            unmet.push("operator confirmation was not given".to_string());
        }
        if live_mode && self.state.read().ui_confirmation.is_none() {
            unmet.push("UI LIVE confirmation not completed".to_string());
        }
        if !unmet.is_empty() {
            return Err(unmet);
        }
        self.state.write().armed = true;
        Ok(())
    }

    /// Disarming a router that was trading LIVE also revokes the UI
    /// confirmation record, so re-arming into LIVE always requires a fresh
    /// confirmation (spec.md §4.14 `disarm()`).
    pub fn disarm(&self) {
        let mut state = self.state.write();
        state.armed = false;
        if self.deps.mode == TradingMode::Live {
            state.ui_confirmation = None;
            state.ui_confirmed_at = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.read().armed
    }

    /// Marks the router as connected to the broker; routing rejects every
    /// intent until this has been set at least once (spec.md §4.14 step 10).
    pub fn connect(&self) {
        self.state.write().connected = true;
    }

    pub fn disconnect(&self) {
        self.state.write().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    pub fn set_account_verification(&self, verification: AccountVerification) {
        self.state.write().account_verification = Some(verification);
    }

    /// Records the operator's UI confirmation. Age is measured from this
    /// call against the router's clock, not the caller's.
    pub fn confirm_ui(&self, confirmation: UiConfirmation) {
        let now = self.deps.clock.now();
        let mut state = self.state.write();
        state.ui_confirmation = Some(confirmation);
        state.ui_confirmed_at = Some(now);
    }

    fn ui_confirmation_age(&self, state: &ArmState) -> Option<std::time::Duration> {
        state.ui_confirmed_at.map(|at| {
            (self.deps.clock.now() - at)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        })
    }

    /// Queries the broker for the account's current balance and caches it,
    /// resetting the staleness clock and fill counter (spec.md §4.14 steps 6
    /// and 12). Failures are logged and leave the prior cached balance in
    /// place rather than blocking routing.
    async fn refresh_balance(&self) -> Option<f64> {
        match self.deps.broker.list_accounts().await {
            Ok(accounts) => {
                let balance = accounts
                    .iter()
                    .find(|a| a.account_id == self.deps.account_id)
                    .or_else(|| accounts.first())
                    .map(|a| a.balance);
                if let Some(balance) = balance {
                    let now = self.deps.clock.now();
                    let mut state = self.state.write();
                    state.balance = Some(balance);
                    state.balance_refreshed_at = Some(now);
                    state.fills_since_refresh = 0;
                }
                balance
            }
            Err(e) => {
                tracing::warn!(error = %e, "account balance refresh failed");
                None
            }
        }
    }

    /// Refreshes the cached balance if it has never been fetched or has gone
    /// stale, then returns the best available balance, falling back to the
    /// caller-supplied seed when nothing is cached yet.
    async fn balance_or_refresh(&self, fallback: f64) -> f64 {
        let stale = {
            let state = self.state.read();
            match state.balance_refreshed_at {
                Some(at) => self.deps.clock.now() - at > balance_stale_after(),
                None => true,
            }
        };
        if stale {
            self.refresh_balance().await;
        }
        self.state.read().balance.unwrap_or(fallback)
    }

    /// Counts a fill toward the every-10-fills refresh and, once the
    /// threshold is hit, refreshes immediately (spec.md §4.14 step 12).
    async fn note_fill_for_balance_refresh(&self) {
        let should_refresh = {
            let mut state = self.state.write();
            state.fills_since_refresh += 1;
            state.fills_since_refresh >= BALANCE_REFRESH_EVERY_N_FILLS
        };
        if should_refresh {
            self.refresh_balance().await;
        }
    }

    /// Routes a single intent through the full stack. Any rejection short
    /// circuits with a typed `ExecutionError`; every outcome (including
    /// rejections and pendings) is recorded to the ledger.
    pub async fn route_intent(&self, request: RouteRequest<'_>) -> Result<RouteOutcome, ExecutionError> {
        // Step 1: trading gates (a no-op pass in DEMO mode).
        let risk_blockers = self.risk_blockers();
        let gates = TradingGates::new(&self.deps.live_gates, &self.deps.risk_settings);
        let (account_verification, ui_confirmation, ui_confirmation_age) = {
            let state = self.state.read();
            (
                state.account_verification.clone(),
                state.ui_confirmation.clone(),
                self.ui_confirmation_age(&state),
            )
        };
        let gate_decision = gates.evaluate(&GateCheckInput {
            mode: self.deps.mode,
            target_account_id: &self.deps.account_id,
            risk_blockers: &risk_blockers,
            kill_switch_triggered: self.deps.kill_switch.is_triggered(),
            prelive_report_age: request.prelive_report_age,
            account_verification: account_verification.as_ref(),
            ui_confirmation: ui_confirmation.as_ref(),
            ui_confirmation_age,
        });
        if !gate_decision.allowed {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Policy,
                format!("trading gate rejected: {}", gate_decision.failed_conditions.join(", ")),
            ));
        }

        // Step 2: pre-order safety (idempotency, circuit breaker, demo size cap).
        let idempotency_key = request.intent.intent_id.to_string();
        if !self.deps.idempotency.check_and_record(&idempotency_key) {
            return Err(ExecutionError::new(ExecutionErrorKind::Validation, "duplicate intent_id"));
        }
        if !self.deps.circuit_breaker.allow() {
            return Err(ExecutionError::new(ExecutionErrorKind::Transient, "circuit breaker is open"));
        }
        if self.deps.mode == TradingMode::Demo {
            if let Err(reason) = validate_demo_size(request.intent.size, self.deps.risk_settings.demo_max_size) {
                return Err(ExecutionError::new(ExecutionErrorKind::Validation, reason));
            }
        }

        // Step 3: allowlist.
        if !self.deps.allowlist.is_allowed(&request.intent.symbol, &request.intent.bot) {
            return Err(ExecutionError::new(ExecutionErrorKind::Policy, "symbol is not allowlisted"));
        }

        // Step 4: record the intent in the ledger and emit the intent event,
        // unconditionally, before anything downstream can reject it. Every
        // intent that clears the checks above leaves an audit trail even if
        // the kill switch, risk engine or arm/connect state stop it later.
        let _ = self.deps.ledger.append(
            request.intent.intent_id,
            "n/a",
            "intent",
            serde_json::json!({
                "symbol": request.intent.symbol,
                "bot": request.intent.bot,
                "side": request.intent.side,
                "size": request.intent.size,
            }),
        );
        event_bus().publish(
            Event::new(EventType::ExecutionIntentCreated)
                .with("symbol", request.intent.symbol.clone())
                .with("intent_id", request.intent.intent_id.to_string()),
        );

        // Step 5: kill switch.
        if self.deps.kill_switch.is_triggered() {
            return Err(ExecutionError::new(ExecutionErrorKind::Policy, "kill switch is triggered"));
        }

        // Step 6: refresh the cached balance if it's gone stale.
        let account_balance = self.balance_or_refresh(request.account_balance).await;

        // Step 7: risk engine.
        let risk_decision = self.deps.risk_engine.evaluate(RiskCheckInput {
            intent: request.intent,
            dealing_rules: request.dealing_rules,
            open_position_count: request.open_position_count,
            account_balance,
            today_realized_pnl: request.today_realized_pnl,
            existing_symbol_exposure: request.existing_symbol_exposure,
            mid_price: request.mid_price,
        });
        if !risk_decision.allowed {
            let reason = risk_decision.rejection_reason.unwrap_or_default();
            let _ = self.deps.ledger.append(
                request.intent.intent_id,
                "n/a",
                "risk_rejected",
                serde_json::json!({"reason": reason}),
            );
            return Err(ExecutionError::new(ExecutionErrorKind::Policy, reason));
        }

        // Steps 8-10: DEMO without demo-arm, or a router never armed, or a
        // router not connected to the broker, stop the intent here, after
        // every safety check but before anything reaches the broker.
        if self.deps.mode == TradingMode::Demo && !self.deps.risk_settings.demo_arm_enabled {
            return Ok(self.record_pending(&request, "demo trading is not armed (DEMO_ARM_ENABLED=false)"));
        }
        if !self.is_armed() {
            return Ok(self.record_pending(&request, "router is not armed"));
        }
        if !self.is_connected() {
            let _ = self.deps.ledger.append(
                request.intent.intent_id,
                "n/a",
                "rejected",
                serde_json::json!({"reason": "router is not connected to the broker"}),
            );
            return Err(ExecutionError::new(ExecutionErrorKind::Transient, "router is not connected to the broker"));
        }

        // Step 11: submit to broker.
        let deal_reference = format!("dr-{}", uuid::Uuid::new_v4());
        self.deps
            .registry
            .register(request.intent, &deal_reference)
            .map_err(|e| ExecutionError::new(ExecutionErrorKind::Validation, e.to_string()))?;

        self.deps
            .registry
            .transition_by_reference(&deal_reference, OrderStatus::Submitted)
            .ok();
        let _ = self.deps.ledger.append(
            request.intent.intent_id,
            &deal_reference,
            "submitted",
            serde_json::json!({"size": risk_decision.adjusted_size}),
        );
        event_bus().publish(Event::new(EventType::ExecutionOrderSubmitted).with("deal_reference", deal_reference.clone()));

        let direction = match request.intent.side.price_direction() {
            crate::domain::order::PriceDirection::Buy => Direction::Buy,
            crate::domain::order::PriceDirection::Sell => Direction::Sell,
        };

        let ack = self
            .deps
            .broker
            .place_market_order(
                request.epic,
                direction,
                risk_decision.adjusted_size,
                request.intent.stop_loss,
                request.intent.take_profit,
                &deal_reference,
            )
            .await;

        match ack {
            Ok(ack) => {
                self.deps.circuit_breaker.record_success();
                self.deps.risk_engine.record_trade();
                if let Some(deal_id) = &ack.deal_id {
                    let _ = self.deps.registry.bind_deal_id(&deal_reference, deal_id.clone());
                    self.deps
                        .registry
                        .transition_by_reference(&deal_reference, OrderStatus::Acknowledged)
                        .ok();
                }
                let _ = self.deps.ledger.append(
                    request.intent.intent_id,
                    &deal_reference,
                    "acknowledged",
                    serde_json::to_value(&ack).unwrap_or(serde_json::Value::Null),
                );
                event_bus().publish(
                    Event::new(EventType::ExecutionOrderAcknowledged).with("deal_reference", deal_reference.clone()),
                );
                // Step 12: every 10 fills, refresh the cached balance.
                self.note_fill_for_balance_refresh().await;
                Ok(RouteOutcome {
                    deal_reference,
                    deal_id: ack.deal_id,
                    status: OrderStatus::Acknowledged,
                })
            }
            Err(err) => {
                let tripped = self.deps.circuit_breaker.record_failure();
                if tripped {
                    self.trip_kill_switch("circuit_breaker_tripped").await;
                }
                self.deps
                    .registry
                    .transition_by_reference(&deal_reference, OrderStatus::Rejected)
                    .ok();
                let _ = self.deps.ledger.append(
                    request.intent.intent_id,
                    &deal_reference,
                    "rejected",
                    serde_json::json!({"error": err.to_string()}),
                );
                event_bus().publish(Event::new(EventType::ExecutionOrderRejected).with("deal_reference", deal_reference.clone()));
                let kind = if err.is_retryable() {
                    ExecutionErrorKind::Transient
                } else {
                    ExecutionErrorKind::BrokerRejected
                };
                Err(ExecutionError::new(kind, err.to_string()))
            }
        }
    }

    /// Records an intent as `Pending`: registered in the order registry and
    /// ledger, but never submitted to the broker (spec.md §4.14 steps 8-9).
    /// The canonical `intent` ledger entry and `ExecutionIntentCreated` event
    /// were already recorded unconditionally at step 4; this only adds the
    /// pending-specific trail.
    fn record_pending(&self, request: &RouteRequest<'_>, reason: &str) -> RouteOutcome {
        let deal_reference = format!("dr-{}", uuid::Uuid::new_v4());
        let _ = self.deps.registry.register(request.intent, &deal_reference);
        let _ = self.deps.ledger.append(
            request.intent.intent_id,
            &deal_reference,
            "pending",
            serde_json::json!({"reason": reason}),
        );
        RouteOutcome {
            deal_reference,
            deal_id: None,
            status: OrderStatus::Pending,
        }
    }

    /// Activates the kill switch and, if `close_on_kill_switch` is set,
    /// attempts to flatten every open position, publishing
    /// `KillSwitchCloseFailed` naming whichever deals stayed open
    /// (spec.md §4.12, §8 scenario 3). Safe to call more than once:
    /// activation is idempotent and a second call with nothing left open is
    /// a no-op close pass.
    pub async fn trip_kill_switch(&self, reason: &str) {
        let newly_activated = self.deps.kill_switch.activate();
        if newly_activated {
            event_bus().publish(Event::new(EventType::KillSwitchActivated).with("reason", reason));
        }

        if !self.deps.risk_settings.close_on_kill_switch {
            return;
        }

        let positions = match self.deps.broker.list_positions().await {
            Ok(positions) => positions,
            Err(_) => return,
        };
        if positions.is_empty() {
            return;
        }
        let outcomes = self.deps.kill_switch.close_all(self.deps.broker.clone(), positions).await;
        let failed_deal_ids: Vec<&str> = outcomes.iter().filter(|o| !o.succeeded).map(|o| o.deal_id.as_str()).collect();
        if !failed_deal_ids.is_empty() {
            event_bus().publish(
                Event::new(EventType::KillSwitchCloseFailed)
                    .with("deal_ids", serde_json::json!(failed_deal_ids))
                    .with("reason", reason),
            );
        }
    }

    /// Closes one open position directly, bypassing the risk engine (an
    /// existing position is, by definition, already inside risk limits) but
    /// still subject to the kill switch and circuit breaker.
    pub async fn close_position(&self, position: &BrokerPosition) -> Result<(), ExecutionError> {
        if self.deps.kill_switch.is_triggered() {
            return Err(ExecutionError::new(ExecutionErrorKind::Policy, "kill switch is triggered"));
        }
        let close_direction = match position.direction {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        };
        self.deps
            .broker
            .close_position(&position.deal_id, close_direction, position.size)
            .await
            .map(|_| ())
            .map_err(|e| ExecutionError::new(ExecutionErrorKind::BrokerRejected, e.to_string()))
    }

    pub fn account_id(&self) -> &str {
        &self.deps.account_id
    }

    /// Mirrors `Settings::live_risk_blockers`, evaluated against just the
    /// two settings groups the router holds rather than the whole
    /// environment-derived `Settings`.
    fn risk_blockers(&self) -> Vec<String> {
        let mut blockers = Vec::new();
        if self.deps.risk_settings.max_position_size <= 0.0 {
            blockers.push("MAX_POSITION_SIZE is not configured".to_string());
        }
        if self.deps.risk_settings.max_daily_loss_pct <= 0.0 {
            blockers.push("MAX_DAILY_LOSS_PCT is not configured".to_string());
        }
        if self.deps.live_gates.live_max_order_size.is_none() {
            blockers.push("LIVE_MAX_ORDER_SIZE is not configured".to_string());
        }
        blockers
    }
}

#[allow(dead_code)]
fn _side_is_close(side: Side) -> bool {
    matches!(side, Side::CloseLong | Side::CloseShort)
}
