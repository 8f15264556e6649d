//! Scheduler (spec.md §4.20): a 60-second tick loop running two periodic
//! jobs — a daily data-freshness check and a weekly walk-forward + selector
//! pass that produces a `Proposal`. Proposals are never auto-applied; in
//! LIVE mode, applying one is fail-closed and always rejected.

use crate::allowlist::Allowlist;
use crate::clock::SharedClock;
use crate::config::TradingMode;
use crate::event_bus::{event_bus, Event, EventType};
use crate::walkforward::{ComboKey, Recommendation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const CHECK_INTERVAL_SECS: i64 = 60;
const NIGHTLY_INTERVAL_SECS: i64 = 24 * 3600;
const WEEKLY_INTERVAL_SECS: i64 = 168 * 3600;

/// A proposal produced by `weekly_optimize`, carrying the combos the
/// selector recommended and the run id of the walk-forward pass that
/// produced them. Never auto-applied — `apply` is a separate, explicit call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub source_run_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub recommendations: Vec<Recommendation>,
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Applied,
    Rejected,
}

/// Hook for the nightly data-freshness check; a stub in this design per
/// spec.md §4.20, intended for an external validator to plug into.
pub trait DataFreshnessCheck: Send + Sync {
    fn check(&self) -> Result<(), String>;
}

pub struct AlwaysFresh;
impl DataFreshnessCheck for AlwaysFresh {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct Scheduler {
    clock: SharedClock,
    allowlist: Arc<Allowlist>,
    freshness_check: Arc<dyn DataFreshnessCheck>,
    last_nightly_at: parking_lot::Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    last_weekly_at: parking_lot::Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    proposals: parking_lot::Mutex<Vec<Proposal>>,
}

impl Scheduler {
    pub fn new(clock: SharedClock, allowlist: Arc<Allowlist>, freshness_check: Arc<dyn DataFreshnessCheck>) -> Self {
        Self {
            clock,
            allowlist,
            freshness_check,
            last_nightly_at: parking_lot::Mutex::new(None),
            last_weekly_at: parking_lot::Mutex::new(None),
            proposals: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn check_interval() -> chrono::Duration {
        chrono::Duration::seconds(CHECK_INTERVAL_SECS)
    }

    fn due(&self, last: Option<chrono::DateTime<chrono::Utc>>, interval_secs: i64) -> bool {
        match last {
            None => true,
            Some(at) => (self.clock.now() - at).num_seconds() >= interval_secs,
        }
    }

    /// Runs `nightly_data_check` if due (spec.md §4.20, 24h interval).
    pub fn run_nightly_if_due(&self) {
        let mut last = self.last_nightly_at.lock();
        if !self.due(*last, NIGHTLY_INTERVAL_SECS) {
            return;
        }
        match self.freshness_check.check() {
            Ok(()) => info!("nightly data check passed"),
            Err(reason) => warn!(reason = %reason, "nightly data check failed"),
        }
        *last = Some(self.clock.now());
    }

    /// Runs `weekly_optimize` if due (spec.md §4.20, 168h interval):
    /// executes the walk-forward pass supplied by `run_walkforward`, selects
    /// combos from the resulting aggregates, and records a pending proposal.
    pub async fn run_weekly_if_due<F, Fut>(&self, source_run_id: impl Into<String>, run_walkforward: F) -> Option<Proposal>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Vec<Recommendation>>,
    {
        {
            let last = self.last_weekly_at.lock();
            if !self.due(*last, WEEKLY_INTERVAL_SECS) {
                return None;
            }
        }
        let recommendations = run_walkforward().await;
        *self.last_weekly_at.lock() = Some(self.clock.now());

        let proposal = Proposal {
            proposal_id: format!("proposal-{}", uuid::Uuid::new_v4()),
            source_run_id: source_run_id.into(),
            created_at: self.clock.now(),
            recommendations,
            status: ProposalStatus::Pending,
        };
        self.proposals.lock().push(proposal.clone());
        info!(proposal_id = %proposal.proposal_id, combos = proposal.recommendations.len(), "weekly optimize produced a proposal");
        Some(proposal)
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.proposals.lock().clone()
    }

    /// Applies a pending proposal to the allowlist. Fail-closed in LIVE
    /// mode: the proposal is marked `Rejected` with a LIVE-mode-blocked
    /// reason rather than applied, regardless of its contents.
    pub fn apply_proposal(&self, proposal_id: &str, mode: TradingMode) -> Result<usize, String> {
        let mut proposals = self.proposals.lock();
        let proposal = proposals
            .iter_mut()
            .find(|p| p.proposal_id == proposal_id)
            .ok_or_else(|| format!("no such proposal: {proposal_id}"))?;

        if proposal.status != ProposalStatus::Pending {
            return Err(format!("proposal {proposal_id} is not pending"));
        }

        if mode == TradingMode::Live {
            proposal.status = ProposalStatus::Rejected;
            return Err("applying a proposal is fail-closed in LIVE mode".to_string());
        }

        let mut applied = 0;
        for rec in &proposal.recommendations {
            let ComboKey { symbol, bot, .. } = &rec.combo;
            self.allowlist
                .upsert(symbol, bot, true, &format!("proposal:{}", proposal.proposal_id))
                .map_err(|e| e.to_string())?;
            applied += 1;
        }
        proposal.status = ProposalStatus::Applied;
        event_bus().publish(
            Event::new(EventType::RecommendationApplied)
                .with("proposal_id", proposal.proposal_id.clone())
                .with("applied_count", applied as i64),
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::walkforward::ComboKey;
    use tempfile::NamedTempFile;

    fn scheduler(start: &str) -> (Arc<Scheduler>, FixedClock, Arc<Allowlist>) {
        let fixed = FixedClock::new(start.parse().unwrap());
        let clock: SharedClock = Arc::new(fixed.clone());
        let tmp = NamedTempFile::new().unwrap();
        let allowlist = Arc::new(Allowlist::load(clock.clone(), tmp.path(), chrono::Duration::hours(24)).unwrap());
        let scheduler = Arc::new(Scheduler::new(clock, allowlist.clone(), Arc::new(AlwaysFresh)));
        (scheduler, fixed, allowlist)
    }

    fn recommendation(symbol: &str, bot: &str) -> Recommendation {
        Recommendation {
            combo: ComboKey {
                symbol: symbol.to_string(),
                bot: bot.to_string(),
                timeframe: "H1".to_string(),
            },
            consistency_score: 3.0,
            rationale: "test".to_string(),
        }
    }

    #[test]
    fn nightly_check_runs_once_then_waits_for_interval() {
        let (scheduler, fixed, _allowlist) = scheduler("2024-01-01T00:00:00Z");
        scheduler.run_nightly_if_due();
        let first_run = *scheduler.last_nightly_at.lock();
        assert!(first_run.is_some());
        fixed.advance(chrono::Duration::hours(1));
        scheduler.run_nightly_if_due();
        assert_eq!(*scheduler.last_nightly_at.lock(), first_run);
    }

    #[tokio::test]
    async fn weekly_optimize_produces_a_pending_proposal() {
        let (scheduler, _fixed, _allowlist) = scheduler("2024-01-01T00:00:00Z");
        let proposal = scheduler
            .run_weekly_if_due("run-1", || async { vec![recommendation("EURUSD", "trend_bot")] })
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.recommendations.len(), 1);
    }

    #[tokio::test]
    async fn weekly_optimize_does_not_rerun_before_interval_elapses() {
        let (scheduler, fixed, _allowlist) = scheduler("2024-01-01T00:00:00Z");
        scheduler
            .run_weekly_if_due("run-1", || async { vec![recommendation("EURUSD", "trend_bot")] })
            .await;
        fixed.advance(chrono::Duration::hours(1));
        let second = scheduler
            .run_weekly_if_due("run-2", || async { vec![recommendation("EURUSD", "trend_bot")] })
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn applying_in_live_mode_is_fail_closed() {
        let (scheduler, _fixed, allowlist) = scheduler("2024-01-01T00:00:00Z");
        let proposal = scheduler
            .run_weekly_if_due("run-1", || async { vec![recommendation("EURUSD", "trend_bot")] })
            .await
            .unwrap();
        let err = scheduler.apply_proposal(&proposal.proposal_id, TradingMode::Live).unwrap_err();
        assert!(err.contains("LIVE"));
        assert!(!allowlist.is_allowed("EURUSD", "trend_bot"));
        assert_eq!(scheduler.proposals()[0].status, ProposalStatus::Rejected);
    }

    #[tokio::test]
    async fn applying_in_demo_mode_writes_to_the_allowlist() {
        let (scheduler, _fixed, allowlist) = scheduler("2024-01-01T00:00:00Z");
        let proposal = scheduler
            .run_weekly_if_due("run-1", || async { vec![recommendation("EURUSD", "trend_bot")] })
            .await
            .unwrap();
        let applied = scheduler.apply_proposal(&proposal.proposal_id, TradingMode::Demo).unwrap();
        assert_eq!(applied, 1);
        assert!(allowlist.is_allowed("EURUSD", "trend_bot"));
        assert_eq!(scheduler.proposals()[0].status, ProposalStatus::Applied);
    }
}
