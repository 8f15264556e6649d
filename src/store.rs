//! Historical bar store: the consumed interface spec.md §6 describes as "a
//! keyed read/write interface" (the columnar storage layer itself is out of
//! scope). An in-memory implementation backs the backtest engine's tests and
//! any deployment that hasn't wired in a real columnar store yet.

use crate::domain::{Bar, Timeframe};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct SymbolSummary {
    pub symbol: String,
    pub bar_counts: Vec<(Timeframe, usize)>,
}

/// Dedup key is `(symbol, timeframe, timestamp)`; writes are idempotent.
#[async_trait]
pub trait HistoricalBarStore: Send + Sync {
    async fn read_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, StoreError>;

    /// Returns `(written_count, deduped_count)`. Writing a bar whose key
    /// already exists replaces it in place and counts as deduped, not
    /// written.
    async fn write_bars(&self, bars: Vec<Bar>, run_id: &str) -> Result<(usize, usize), StoreError>;

    async fn get_summary(&self) -> Result<Vec<SymbolSummary>, StoreError>;
}

type Key = (String, Timeframe, DateTime<Utc>);

#[derive(Default)]
pub struct InMemoryBarStore {
    bars: parking_lot::RwLock<BTreeMap<Key, Bar>>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for tests/fixtures: load a full symbol's history at once.
    pub fn seed(&self, bars: impl IntoIterator<Item = Bar>) {
        let mut guard = self.bars.write();
        for bar in bars {
            guard.insert(bar.key(), bar);
        }
    }
}

#[async_trait]
impl HistoricalBarStore for InMemoryBarStore {
    async fn read_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, StoreError> {
        let guard = self.bars.read();
        let mut out: Vec<Bar> = guard
            .iter()
            .filter(|((s, tf, ts), _)| {
                s == symbol
                    && *tf == timeframe
                    && start.map(|st| *ts >= st).unwrap_or(true)
                    && end.map(|en| *ts <= en).unwrap_or(true)
            })
            .map(|(_, bar)| bar.clone())
            .collect();
        out.sort_by_key(|b| b.timestamp);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn write_bars(&self, bars: Vec<Bar>, _run_id: &str) -> Result<(usize, usize), StoreError> {
        let mut guard = self.bars.write();
        let mut written = 0usize;
        let mut deduped = 0usize;
        for bar in bars {
            if guard.insert(bar.key(), bar).is_some() {
                deduped += 1;
            } else {
                written += 1;
            }
        }
        Ok((written, deduped))
    }

    async fn get_summary(&self) -> Result<Vec<SymbolSummary>, StoreError> {
        let guard = self.bars.read();
        let mut by_symbol: std::collections::HashMap<String, Vec<(Timeframe, usize)>> =
            std::collections::HashMap::new();
        let mut counts: std::collections::HashMap<(String, Timeframe), usize> =
            std::collections::HashMap::new();
        for (symbol, tf, _) in guard.keys() {
            *counts.entry((symbol.clone(), *tf)).or_insert(0) += 1;
        }
        for ((symbol, tf), count) in counts {
            by_symbol.entry(symbol).or_default().push((tf, count));
        }
        Ok(by_symbol
            .into_iter()
            .map(|(symbol, bar_counts)| SymbolSummary { symbol, bar_counts })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Bar;

    fn bar(ts: &str, close: f64) -> Bar {
        Bar::new(
            "EURUSD",
            Timeframe::M1,
            ts.parse().unwrap(),
            close,
            close + 0.001,
            close - 0.001,
            close,
            100.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_is_idempotent_on_duplicate_key() {
        let store = InMemoryBarStore::new();
        let b = bar("2024-01-01T00:00:00Z", 1.1);
        let (written, deduped) = store.write_bars(vec![b.clone()], "run-1").await.unwrap();
        assert_eq!((written, deduped), (1, 0));
        let (written2, deduped2) = store.write_bars(vec![b], "run-2").await.unwrap();
        assert_eq!((written2, deduped2), (0, 1));
    }

    #[tokio::test]
    async fn read_bars_returns_ordered_by_timestamp() {
        let store = InMemoryBarStore::new();
        store
            .write_bars(
                vec![bar("2024-01-01T00:02:00Z", 1.2), bar("2024-01-01T00:01:00Z", 1.1)],
                "run-1",
            )
            .await
            .unwrap();
        let bars = store
            .read_bars("EURUSD", Timeframe::M1, None, None, None)
            .await
            .unwrap();
        assert!(bars[0].timestamp < bars[1].timestamp);
    }
}
