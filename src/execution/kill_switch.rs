//! Kill switch (spec.md §4.12): a single armed/disarmed flag that, once
//! activated, attempts to flatten every open position with bounded retries,
//! and persists its state to disk so a process restart doesn't silently
//! re-arm.

use crate::broker::{BrokerAdapter, BrokerPosition, Direction};
use crate::clock::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSwitchStatus {
    Armed,
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    status: KillSwitchStatus,
    triggered_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct CloseAttemptOutcome {
    pub deal_id: String,
    pub succeeded: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

const MAX_CLOSE_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct KillSwitch {
    clock: SharedClock,
    persistence_path: PathBuf,
    state: Mutex<PersistedState>,
}

impl KillSwitch {
    /// Loads prior state from `persistence_path` if present, otherwise
    /// starts armed (not yet triggered).
    pub fn load(clock: SharedClock, persistence_path: impl Into<PathBuf>) -> Self {
        let persistence_path = persistence_path.into();
        let state = std::fs::read_to_string(&persistence_path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or(PersistedState {
                status: KillSwitchStatus::Armed,
                triggered_at: None,
            });
        Self {
            clock,
            persistence_path,
            state: Mutex::new(state),
        }
    }

    pub fn status(&self) -> KillSwitchStatus {
        self.state.lock().status
    }

    pub fn is_triggered(&self) -> bool {
        self.status() == KillSwitchStatus::Triggered
    }

    fn persist(&self, state: &PersistedState) -> std::io::Result<()> {
        if let Some(parent) = self.persistence_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.persistence_path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&serde_json::to_vec_pretty(state)?)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.persistence_path)
    }

    /// Activating an already-triggered kill switch is a no-op: idempotent
    /// activation (spec.md §4.12).
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == KillSwitchStatus::Triggered {
            return false;
        }
        state.status = KillSwitchStatus::Triggered;
        state.triggered_at = Some(self.clock.now());
        let _ = self.persist(&state);
        true
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = KillSwitchStatus::Armed;
        state.triggered_at = None;
        let _ = self.persist(&state);
    }

    /// Attempts to close every open position in parallel (spec.md §4.12: "an
    /// in-parallel close of all currently open positions"), retrying each up
    /// to `MAX_CLOSE_RETRIES` times with a fixed backoff. Wall-clock time is
    /// bounded by the slowest single position, not the sum across positions.
    /// Positions that still fail after retries are reported, not silently
    /// dropped.
    pub async fn close_all(&self, broker: Arc<dyn BrokerAdapter>, positions: Vec<BrokerPosition>) -> Vec<CloseAttemptOutcome> {
        let tasks: Vec<_> = positions
            .into_iter()
            .map(|position| {
                let broker = broker.clone();
                tokio::spawn(async move { Self::close_one(broker.as_ref(), position).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(CloseAttemptOutcome {
                    deal_id: "unknown".to_string(),
                    succeeded: false,
                    attempts: 0,
                    last_error: Some(format!("close task panicked: {join_err}")),
                }),
            }
        }
        outcomes
    }

    async fn close_one(broker: &dyn BrokerAdapter, position: BrokerPosition) -> CloseAttemptOutcome {
        let close_direction = match position.direction {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        };
        let mut attempts = 0u32;
        let mut last_error = None;
        let mut succeeded = false;
        while attempts < MAX_CLOSE_RETRIES {
            attempts += 1;
            match broker.close_position(&position.deal_id, close_direction, position.size).await {
                Ok(_) => {
                    succeeded = true;
                    break;
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    if attempts < MAX_CLOSE_RETRIES {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        CloseAttemptOutcome {
            deal_id: position.deal_id,
            succeeded,
            attempts,
            last_error,
        }
    }

    pub fn persistence_path(&self) -> &Path {
        &self.persistence_path
    }
}

pub fn load_shared(clock: SharedClock, persistence_path: impl Into<PathBuf>) -> Arc<KillSwitch> {
    Arc::new(KillSwitch::load(clock, persistence_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSummary, MarketDetails, OrderAck, WorkingOrder};
    use crate::clock::FixedClock;
    use crate::error::BrokerError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn clock() -> SharedClock {
        Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()))
    }

    struct FlakyBroker {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl BrokerAdapter for FlakyBroker {
        async fn verify_session(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn list_accounts(&self) -> Result<Vec<AccountSummary>, BrokerError> {
            Ok(vec![])
        }
        async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            Ok(vec![])
        }
        async fn place_market_order(
            &self,
            _epic: &str,
            _direction: Direction,
            _size: f64,
            _stop_level: Option<f64>,
            _limit_level: Option<f64>,
            _deal_reference: &str,
        ) -> Result<OrderAck, BrokerError> {
            unimplemented!()
        }
        async fn close_position(&self, deal_id: &str, _direction: Direction, _size: f64) -> Result<OrderAck, BrokerError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(BrokerError::Transport("timeout".to_string()));
            }
            Ok(OrderAck {
                deal_reference: format!("close-{deal_id}"),
                deal_id: Some(deal_id.to_string()),
                deal_status: None,
                status_raw: "ACCEPTED".to_string(),
                rejection_reason: None,
                raw: serde_json::json!({}),
            })
        }
        async fn get_working_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError> {
            Ok(vec![])
        }
        async fn cancel_working_order(&self, _deal_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_market_details(&self, epic: &str) -> Result<MarketDetails, BrokerError> {
            Ok(MarketDetails {
                epic: epic.to_string(),
                bid: None,
                offer: None,
                tradeable: false,
                min_deal_size: 0.1,
            })
        }
    }

    /// Fails a configurable number of times per deal id independently, so a
    /// multi-position test can assert on deterministic per-position retry
    /// counts regardless of dispatch order.
    struct PerDealFlakyBroker {
        fail_times: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl BrokerAdapter for PerDealFlakyBroker {
        async fn verify_session(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn list_accounts(&self) -> Result<Vec<AccountSummary>, BrokerError> {
            Ok(vec![])
        }
        async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            Ok(vec![])
        }
        async fn place_market_order(
            &self,
            _epic: &str,
            _direction: Direction,
            _size: f64,
            _stop_level: Option<f64>,
            _limit_level: Option<f64>,
            _deal_reference: &str,
        ) -> Result<OrderAck, BrokerError> {
            unimplemented!()
        }
        async fn close_position(&self, deal_id: &str, _direction: Direction, _size: f64) -> Result<OrderAck, BrokerError> {
            let mut fail_times = self.fail_times.lock();
            let remaining = fail_times.entry(deal_id.to_string()).or_insert(0);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::Transport("timeout".to_string()));
            }
            Ok(OrderAck {
                deal_reference: format!("close-{deal_id}"),
                deal_id: Some(deal_id.to_string()),
                deal_status: None,
                status_raw: "ACCEPTED".to_string(),
                rejection_reason: None,
                raw: serde_json::json!({}),
            })
        }
        async fn get_working_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError> {
            Ok(vec![])
        }
        async fn cancel_working_order(&self, _deal_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_market_details(&self, epic: &str) -> Result<MarketDetails, BrokerError> {
            Ok(MarketDetails {
                epic: epic.to_string(),
                bid: None,
                offer: None,
                tradeable: false,
                min_deal_size: 0.1,
            })
        }
    }

    fn position(deal_id: &str) -> BrokerPosition {
        BrokerPosition {
            deal_id: deal_id.to_string(),
            epic: "CS.D.EURUSD.CFD.IP".to_string(),
            direction: Direction::Buy,
            size: 1.0,
            entry_level: 1.1,
            stop_level: None,
            limit_level: None,
        }
    }

    #[test]
    fn activation_is_idempotent() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let ks = KillSwitch::load(clock(), tmp.path());
        assert!(ks.activate());
        assert!(!ks.activate());
        assert_eq!(ks.status(), KillSwitchStatus::Triggered);
    }

    #[test]
    fn persisted_state_survives_reload() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let ks = KillSwitch::load(clock(), &path);
        ks.activate();
        let reloaded = KillSwitch::load(clock(), &path);
        assert_eq!(reloaded.status(), KillSwitchStatus::Triggered);
    }

    #[tokio::test]
    async fn close_all_retries_transient_failures_before_succeeding() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let ks = KillSwitch::load(clock(), tmp.path());
        let broker: Arc<dyn BrokerAdapter> = Arc::new(FlakyBroker {
            fail_times: AtomicU32::new(2),
        });
        let outcomes = ks.close_all(broker, vec![position("DEAL-1")]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded);
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn close_all_reports_persistent_failure_after_exhausting_retries() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let ks = KillSwitch::load(clock(), tmp.path());
        let broker: Arc<dyn BrokerAdapter> = Arc::new(FlakyBroker {
            fail_times: AtomicU32::new(10),
        });
        let outcomes = ks.close_all(broker, vec![position("DEAL-1")]).await;
        assert!(!outcomes[0].succeeded);
        assert_eq!(outcomes[0].attempts, MAX_CLOSE_RETRIES);
        assert!(outcomes[0].last_error.is_some());
    }

    #[tokio::test]
    async fn close_all_closes_multiple_positions_concurrently() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let ks = KillSwitch::load(clock(), tmp.path());
        let mut fail_times = HashMap::new();
        fail_times.insert("DEAL-1".to_string(), 1);
        fail_times.insert("DEAL-2".to_string(), 1);
        fail_times.insert("DEAL-3".to_string(), 1);
        let broker: Arc<dyn BrokerAdapter> = Arc::new(PerDealFlakyBroker {
            fail_times: Mutex::new(fail_times),
        });
        let positions = vec![position("DEAL-1"), position("DEAL-2"), position("DEAL-3")];

        let started = std::time::Instant::now();
        let outcomes = ks.close_all(broker, positions).await;
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.succeeded));
        assert!(outcomes.iter().all(|o| o.attempts == 2));
        // Each position needs exactly one backoff. Serialized, three
        // positions would take at least 3 * RETRY_BACKOFF; run in parallel,
        // it should be close to a single backoff.
        assert!(
            elapsed < RETRY_BACKOFF * 3,
            "close_all took {elapsed:?}, looks serialized rather than parallel"
        );
    }
}
