//! Execution ledger (spec.md §4.13): an append-only JSONL record of every
//! order-lifecycle event plus a manifest and periodic position snapshots,
//! grounded in the same atomic-write convention as `backtest::artifacts`.

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub at: DateTime<Utc>,
    pub intent_id: uuid::Uuid,
    pub deal_reference: String,
    pub event: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerManifest {
    pub entries_appended: u64,
    pub corrupted_lines_skipped: u64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshotRow {
    pub at: DateTime<Utc>,
    pub deal_id: String,
    pub epic: String,
    pub size: f64,
    pub entry_level: f64,
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&serde_json::to_vec_pretty(value)?)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

pub struct ExecutionLedger {
    clock: SharedClock,
    dir: PathBuf,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    entries_appended: u64,
    corrupted_lines_skipped: u64,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl ExecutionLedger {
    pub fn open(clock: SharedClock, dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let ledger = Self {
            clock,
            dir,
            state: Mutex::new(LedgerState {
                entries_appended: 0,
                corrupted_lines_skipped: 0,
                last_snapshot_at: None,
            }),
        };
        ledger.write_manifest()?;
        Ok(ledger)
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("positions_snapshot.jsonl")
    }

    fn write_manifest(&self) -> std::io::Result<()> {
        let state = self.state.lock();
        atomic_write_json(
            &self.manifest_path(),
            &LedgerManifest {
                entries_appended: state.entries_appended,
                corrupted_lines_skipped: state.corrupted_lines_skipped,
                last_snapshot_at: state.last_snapshot_at,
            },
        )
    }

    /// Appends one event, fsyncing the line so a crash immediately after
    /// `append` never loses a partially-flushed write.
    pub fn append(&self, intent_id: uuid::Uuid, deal_reference: &str, event: &str, detail: serde_json::Value) -> std::io::Result<()> {
        let entry = LedgerEntry {
            at: self.clock.now(),
            intent_id,
            deal_reference: deal_reference.to_string(),
            event: event.to_string(),
            detail,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        {
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(self.events_path())?;
            f.write_all(line.as_bytes())?;
            f.sync_all()?;
        }
        self.state.lock().entries_appended += 1;
        self.write_manifest()
    }

    /// Reads back every valid entry, skipping (and counting) any line that
    /// fails to parse as JSON rather than aborting the whole read — a
    /// torn final write from a crash must not make the rest of the ledger
    /// unreadable.
    pub fn read_all(&self) -> std::io::Result<Vec<LedgerEntry>> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();
        let mut corrupted = 0u64;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => corrupted += 1,
            }
        }
        if corrupted > 0 {
            self.state.lock().corrupted_lines_skipped += corrupted;
            let _ = self.write_manifest();
        }
        Ok(entries)
    }

    /// Appends a position snapshot row; called periodically by the router's
    /// reconciliation tick rather than on every event.
    pub fn snapshot_positions(&self, rows: &[PositionSnapshotRow]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(self.snapshot_path())?;
        for row in rows {
            let mut line = serde_json::to_string(row)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.sync_all()?;
        self.state.lock().last_snapshot_at = Some(self.clock.now());
        self.write_manifest()
    }

    pub fn manifest(&self) -> LedgerManifest {
        let state = self.state.lock();
        LedgerManifest {
            entries_appended: state.entries_appended,
            corrupted_lines_skipped: state.corrupted_lines_skipped,
            last_snapshot_at: state.last_snapshot_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::io::Write as _;

    fn clock() -> SharedClock {
        std::sync::Arc::new(FixedClock::new("2024-01-01T00:00:00Z".parse().unwrap()))
    }

    #[test]
    fn append_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ExecutionLedger::open(clock(), tmp.path()).unwrap();
        let intent_id = uuid::Uuid::new_v4();
        ledger.append(intent_id, "ref-1", "submitted", serde_json::json!({"symbol": "EURUSD"})).unwrap();
        ledger.append(intent_id, "ref-1", "filled", serde_json::json!({"price": 1.1})).unwrap();
        let entries = ledger.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(ledger.manifest().entries_appended, 2);
    }

    #[test]
    fn corrupted_line_is_skipped_with_warning_count_not_aborting_read() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ExecutionLedger::open(clock(), tmp.path()).unwrap();
        let intent_id = uuid::Uuid::new_v4();
        ledger.append(intent_id, "ref-1", "submitted", serde_json::json!({})).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(tmp.path().join("events.jsonl")).unwrap();
        writeln!(f, "{{not valid json").unwrap();
        ledger.append(intent_id, "ref-1", "filled", serde_json::json!({})).unwrap();

        let entries = ledger.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(ledger.manifest().corrupted_lines_skipped, 1);
    }

    #[test]
    fn snapshot_updates_manifest_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ExecutionLedger::open(clock(), tmp.path()).unwrap();
        assert!(ledger.manifest().last_snapshot_at.is_none());
        ledger
            .snapshot_positions(&[PositionSnapshotRow {
                at: Utc::now(),
                deal_id: "DEAL-1".to_string(),
                epic: "CS.D.EURUSD.CFD.IP".to_string(),
                size: 1.0,
                entry_level: 1.1,
            }])
            .unwrap();
        assert!(ledger.manifest().last_snapshot_at.is_some());
    }
}
