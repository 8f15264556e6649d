//! Trading gates (spec.md §4.11): DEMO orders always proceed; LIVE orders
//! must clear every one of a fixed set of conditions or the whole stack
//! fails closed. No single satisfied condition is ever treated as
//! sufficient on its own.

use crate::config::{LiveGateSettings, RiskSettings, TradingMode};

/// Broker-side confirmation that the account the router is about to trade
/// is really the configured LIVE account (spec.md §4.11 condition 5).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountVerification {
    pub account_id: String,
    pub is_live: bool,
    pub available_balance: f64,
}

/// The operator's UI confirmation flow: a typed phrase, the LIVE enable
/// token, and the prelive checklist all acknowledged in one sitting
/// (spec.md §4.11 condition 6).
#[derive(Debug, Clone, PartialEq)]
pub struct UiConfirmation {
    pub phrase_confirmed: bool,
    pub provided_token: String,
    pub prelive_checkmarks_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateCheckInput<'a> {
    pub mode: TradingMode,
    pub target_account_id: &'a str,
    pub risk_blockers: &'a [String],
    pub kill_switch_triggered: bool,
    pub prelive_report_age: Option<std::time::Duration>,
    pub account_verification: Option<&'a AccountVerification>,
    pub ui_confirmation: Option<&'a UiConfirmation>,
    pub ui_confirmation_age: Option<std::time::Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub failed_conditions: Vec<String>,
}

/// Constant-time comparison so token matching doesn't leak timing
/// information about how many leading characters matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct TradingGates<'s> {
    live_gates: &'s LiveGateSettings,
    risk: &'s RiskSettings,
}

impl<'s> TradingGates<'s> {
    pub fn new(live_gates: &'s LiveGateSettings, risk: &'s RiskSettings) -> Self {
        Self { live_gates, risk }
    }

    /// Evaluates the full condition stack. DEMO mode short-circuits to
    /// allowed; LIVE mode evaluates every condition and fails closed on any
    /// single missing one, per spec.md §9 "LIVE is fail-closed, never
    /// fail-open".
    pub fn evaluate(&self, input: &GateCheckInput) -> GateDecision {
        if input.mode == TradingMode::Demo {
            return GateDecision {
                allowed: true,
                failed_conditions: Vec::new(),
            };
        }

        let mut failed = Vec::new();

        // 1. LIVE trading must be explicitly enabled.
        if !self.live_gates.live_trading_enabled {
            failed.push("live_trading_disabled".to_string());
        }

        // 2. A LIVE enable token must be configured (matching it against
        // what the operator supplied happens as part of the UI
        // confirmation check below).
        if self.live_gates.live_enable_token.is_none() {
            failed.push("live_enable_token_not_configured".to_string());
        }

        // 3. All mandatory risk parameters must be set.
        if !input.risk_blockers.is_empty() {
            failed.push("risk_settings_incomplete".to_string());
        }

        // 4. LIVE_ACCOUNT_ID must be set.
        match &self.live_gates.live_account_id {
            Some(account_id) if account_id == input.target_account_id => {}
            _ => failed.push("live_account_id_not_configured".to_string()),
        }

        // 5. Account verification exists, is flagged is_live, matches
        // LIVE_ACCOUNT_ID, and reports a positive available balance.
        let account_verified = match (input.account_verification, &self.live_gates.live_account_id) {
            (Some(verification), Some(expected_account_id)) => {
                verification.is_live && &verification.account_id == expected_account_id && verification.available_balance > 0.0
            }
            _ => false,
        };
        if !account_verified {
            failed.push("account_verification_missing_or_invalid".to_string());
        }

        // 6. UI confirmation exists, is within TTL, and has the phrase,
        // token and prelive checkmarks all true. The token half of this
        // check is the constant-time comparison spec.md §4.11 calls for.
        let ui_confirmed = match (input.ui_confirmation, input.ui_confirmation_age, &self.live_gates.live_enable_token) {
            (Some(confirmation), Some(age), Some(expected_token)) => {
                confirmation.phrase_confirmed
                    && confirmation.prelive_checkmarks_confirmed
                    && constant_time_eq(expected_token, &confirmation.provided_token)
                    && age.as_secs() <= self.live_gates.live_confirmation_ttl_s
            }
            _ => false,
        };
        if !ui_confirmed {
            failed.push("UI LIVE confirmation not completed".to_string());
        }

        // 7. Kill switch must not be triggered.
        if input.kill_switch_triggered {
            failed.push("kill_switch_triggered".to_string());
        }

        // 8. A fresh prelive checklist report must exist.
        match input.prelive_report_age {
            Some(age) if age.as_secs() <= self.live_gates.live_prelive_max_age_s => {}
            _ => failed.push("prelive_report_missing_or_stale".to_string()),
        }

        GateDecision {
            allowed: failed.is_empty(),
            failed_conditions: failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_gates() -> LiveGateSettings {
        LiveGateSettings {
            live_trading_enabled: true,
            live_enable_token: Some("secret-token".to_string()),
            live_account_id: Some("ACC-1".to_string()),
            live_max_order_size: Some(1.0),
            live_confirmation_ttl_s: 300,
            live_prelive_max_age_s: 3600,
        }
    }

    fn risk() -> RiskSettings {
        RiskSettings {
            max_position_size: 1.0,
            max_concurrent_positions: 5,
            max_daily_loss_pct: 5.0,
            max_trades_per_hour: 20,
            per_symbol_exposure_cap: 10_000.0,
            require_sl: true,
            close_on_kill_switch: true,
            require_arm_confirmation: true,
            demo_arm_enabled: false,
            demo_max_size: 1.0,
        }
    }

    fn verified_account() -> AccountVerification {
        AccountVerification {
            account_id: "ACC-1".to_string(),
            is_live: true,
            available_balance: 5_000.0,
        }
    }

    fn confirmed_ui() -> UiConfirmation {
        UiConfirmation {
            phrase_confirmed: true,
            provided_token: "secret-token".to_string(),
            prelive_checkmarks_confirmed: true,
        }
    }

    fn fully_open_input<'a>(account: &'a AccountVerification, ui: &'a UiConfirmation) -> GateCheckInput<'a> {
        GateCheckInput {
            mode: TradingMode::Live,
            target_account_id: "ACC-1",
            risk_blockers: &[],
            kill_switch_triggered: false,
            prelive_report_age: Some(std::time::Duration::from_secs(10)),
            account_verification: Some(account),
            ui_confirmation: Some(ui),
            ui_confirmation_age: Some(std::time::Duration::from_secs(10)),
        }
    }

    #[test]
    fn demo_mode_always_allowed() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let mut input = fully_open_input(&account, &ui);
        input.mode = TradingMode::Demo;
        let decision = gates.evaluate(&input);
        assert!(decision.allowed);
    }

    #[test]
    fn live_mode_with_all_conditions_met_is_allowed() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let decision = gates.evaluate(&fully_open_input(&account, &ui));
        assert!(decision.allowed, "{:?}", decision.failed_conditions);
    }

    #[test]
    fn single_missing_condition_fails_closed() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let mut input = fully_open_input(&account, &ui);
        input.kill_switch_triggered = true;
        let decision = gates.evaluate(&input);
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"kill_switch_triggered".to_string()));
    }

    #[test]
    fn missing_ui_confirmation_is_rejected_with_exact_reason() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let mut input = fully_open_input(&account, &ui);
        input.ui_confirmation = None;
        input.ui_confirmation_age = None;
        let decision = gates.evaluate(&input);
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"UI LIVE confirmation not completed".to_string()));
    }

    #[test]
    fn token_mismatch_in_ui_confirmation_is_rejected() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let mut ui = confirmed_ui();
        ui.provided_token = "wrong-token".to_string();
        let decision = gates.evaluate(&fully_open_input(&account, &ui));
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"UI LIVE confirmation not completed".to_string()));
    }

    #[test]
    fn stale_ui_confirmation_fails_closed() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let mut input = fully_open_input(&account, &ui);
        input.ui_confirmation_age = Some(std::time::Duration::from_secs(99_999));
        let decision = gates.evaluate(&input);
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"UI LIVE confirmation not completed".to_string()));
    }

    #[test]
    fn account_verification_not_live_is_rejected() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let mut account = verified_account();
        account.is_live = false;
        let ui = confirmed_ui();
        let decision = gates.evaluate(&fully_open_input(&account, &ui));
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"account_verification_missing_or_invalid".to_string()));
    }

    #[test]
    fn account_verification_with_zero_balance_is_rejected() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let mut account = verified_account();
        account.available_balance = 0.0;
        let ui = confirmed_ui();
        let decision = gates.evaluate(&fully_open_input(&account, &ui));
        assert!(!decision.allowed);
        assert!(decision.failed_conditions.contains(&"account_verification_missing_or_invalid".to_string()));
    }

    #[test]
    fn stale_prelive_report_fails_closed() {
        let lg = live_gates();
        let r = risk();
        let gates = TradingGates::new(&lg, &r);
        let account = verified_account();
        let ui = confirmed_ui();
        let mut input = fully_open_input(&account, &ui);
        input.prelive_report_age = Some(std::time::Duration::from_secs(99_999));
        let decision = gates.evaluate(&input);
        assert!(!decision.allowed);
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
