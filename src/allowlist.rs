//! Symbol/bot allowlist (spec.md §3 "Allowlist Entry"): the set of
//! (symbol, bot) pairs the autopilot and router are permitted to trade,
//! persisted to disk and refreshed by the scheduler's recommendation
//! proposals. An entry that hasn't been refreshed recently is treated as
//! disabled rather than trusted indefinitely.

use crate::clock::SharedClock;
use crate::execution::router::AllowlistCheck;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllowlistEntry {
    pub symbol: String,
    pub bot: String,
    pub enabled: bool,
    pub added_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedAllowlist {
    entries: Vec<AllowlistEntry>,
}

fn key(symbol: &str, bot: &str) -> String {
    format!("{symbol}::{bot}")
}

pub struct Allowlist {
    clock: SharedClock,
    path: PathBuf,
    /// An entry whose `last_refreshed_at` is older than this is treated as
    /// disabled even if its `enabled` flag is still `true`.
    max_staleness: chrono::Duration,
    entries: RwLock<HashMap<String, AllowlistEntry>>,
}

impl Allowlist {
    pub fn load(clock: SharedClock, path: impl Into<PathBuf>, max_staleness: chrono::Duration) -> std::io::Result<Self> {
        let path = path.into();
        let persisted: PersistedAllowlist = std::fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default();
        let entries = persisted
            .entries
            .into_iter()
            .map(|e| (key(&e.symbol, &e.bot), e))
            .collect();
        Ok(Self {
            clock,
            path,
            max_staleness,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries: Vec<AllowlistEntry> = self.entries.read().values().cloned().collect();
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&serde_json::to_vec_pretty(&PersistedAllowlist { entries })?)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
    }

    /// Adds or refreshes an entry, stamping `last_refreshed_at` with the
    /// current time so the staleness check above starts counting again.
    pub fn upsert(&self, symbol: &str, bot: &str, enabled: bool, source: &str) -> std::io::Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let k = key(symbol, bot);
        entries
            .entry(k)
            .and_modify(|e| {
                e.enabled = enabled;
                e.last_refreshed_at = now;
                e.source = source.to_string();
            })
            .or_insert_with(|| AllowlistEntry {
                symbol: symbol.to_string(),
                bot: bot.to_string(),
                enabled,
                added_at: now,
                last_refreshed_at: now,
                source: source.to_string(),
            });
        drop(entries);
        self.persist()
    }

    pub fn remove(&self, symbol: &str, bot: &str) -> std::io::Result<()> {
        self.entries.write().remove(&key(symbol, bot));
        self.persist()
    }

    pub fn is_allowed(&self, symbol: &str, bot: &str) -> bool {
        let entries = self.entries.read();
        match entries.get(&key(symbol, bot)) {
            Some(entry) => {
                let age = self.clock.now() - entry.last_refreshed_at;
                entry.enabled && age <= self.max_staleness
            }
            None => false,
        }
    }

    pub fn entries(&self) -> Vec<AllowlistEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AllowlistCheck for Allowlist {
    fn is_allowed(&self, symbol: &str, bot: &str) -> bool {
        Allowlist::is_allowed(self, symbol, bot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn clock(start: &str) -> FixedClock {
        FixedClock::new(start.parse().unwrap())
    }

    #[test]
    fn unknown_pair_is_not_allowed() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let allowlist = Allowlist::load(
            std::sync::Arc::new(clock("2024-01-01T00:00:00Z")),
            tmp.path(),
            chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(!allowlist.is_allowed("EURUSD", "bot"));
    }

    #[test]
    fn freshly_refreshed_enabled_entry_is_allowed() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let allowlist = Allowlist::load(
            std::sync::Arc::new(clock("2024-01-01T00:00:00Z")),
            tmp.path(),
            chrono::Duration::hours(1),
        )
        .unwrap();
        allowlist.upsert("EURUSD", "bot", true, "scheduler").unwrap();
        assert!(allowlist.is_allowed("EURUSD", "bot"));
    }

    #[test]
    fn stale_entry_is_treated_as_disabled() {
        let fixed = clock("2024-01-01T00:00:00Z");
        let clock_arc = std::sync::Arc::new(fixed.clone());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let allowlist = Allowlist::load(clock_arc, tmp.path(), chrono::Duration::hours(1)).unwrap();
        allowlist.upsert("EURUSD", "bot", true, "scheduler").unwrap();
        fixed.advance(chrono::Duration::hours(2));
        assert!(!allowlist.is_allowed("EURUSD", "bot"));
    }

    #[test]
    fn persisted_allowlist_reloads_across_instances() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        {
            let allowlist = Allowlist::load(
                std::sync::Arc::new(clock("2024-01-01T00:00:00Z")),
                &path,
                chrono::Duration::hours(1),
            )
            .unwrap();
            allowlist.upsert("GBPUSD", "bot2", true, "manual").unwrap();
        }
        let reloaded = Allowlist::load(
            std::sync::Arc::new(clock("2024-01-01T00:00:00Z")),
            &path,
            chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(reloaded.is_allowed("GBPUSD", "bot2"));
    }
}
