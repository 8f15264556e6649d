//! Run artefact layout (spec.md §6): manifest, equity curve, trades, orders,
//! metrics and warnings written under `runs/{run_id}/`, keyed by a
//! content-addressable run id. "Columnar format suitable for offline
//! analysis" is realized here as newline-delimited JSON, the simplest
//! format both `pandas.read_json` and any columnar loader can ingest
//! directly.

use crate::backtest::metrics::PerformanceMetrics;
use crate::backtest::portfolio::Portfolio;
use crate::domain::{EquityPoint, TradeRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Deterministic run id: a content hash of the run's config, so that the
/// same (config, bars, seed) always produces the same id and, downstream,
/// byte-identical artefacts (spec.md §4.6 determinism invariant).
pub fn run_id(config_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    format!("run_{:x}", hasher.finalize())[..20].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub config: serde_json::Value,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub engine_version: String,
}

pub const ENGINE_VERSION: &str = "1.0.0";

/// Writes every artefact for one completed run under `root/runs/{run_id}/`.
/// Each file is written atomically (temp file + rename) so a concurrent
/// reader never observes a partial file (spec.md §7, §8 "atomic artefact
/// write" law).
pub struct ArtifactWriter {
    run_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl AsRef<Path>, run_id: &str) -> std::io::Result<Self> {
        let run_dir = root.as_ref().join("runs").join(run_id);
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self { run_dir })
    }

    fn atomic_write(&self, filename: &str, contents: &[u8]) -> std::io::Result<()> {
        let final_path = self.run_dir.join(filename);
        let tmp_path = self.run_dir.join(format!("{filename}.tmp"));
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(contents)?;
            f.sync_all()?;
        }
        match std::fs::rename(&tmp_path, &final_path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        self.atomic_write("manifest.json", &json)
    }

    pub fn write_equity_curve(&self, curve: &[EquityPoint]) -> std::io::Result<()> {
        self.write_jsonl("equity_curve.jsonl", curve)
    }

    pub fn write_trades(&self, trades: &[TradeRecord]) -> std::io::Result<()> {
        self.write_jsonl("trades.jsonl", trades)
    }

    pub fn write_orders(&self, orders: &[serde_json::Value]) -> std::io::Result<()> {
        self.write_jsonl("orders.jsonl", orders)
    }

    pub fn write_metrics(&self, per_bot: &HashMap<String, PerformanceMetrics>, combined: &PerformanceMetrics) -> std::io::Result<()> {
        let payload = serde_json::json!({
            "per_bot": per_bot,
            "combined": combined,
        });
        let json = serde_json::to_vec_pretty(&payload)?;
        self.atomic_write("metrics.json", &json)
    }

    pub fn write_warnings(&self, warnings: &[String]) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(warnings)?;
        self.atomic_write("warnings.json", &json)
    }

    fn write_jsonl<T: Serialize>(&self, filename: &str, rows: &[T]) -> std::io::Result<()> {
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        self.atomic_write(filename, &buf)
    }
}

/// Snapshot of a portfolio's artefact-relevant state, used by the engine to
/// avoid re-borrowing the portfolio across the write calls above.
pub struct RunArtifacts {
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
}

impl RunArtifacts {
    pub fn from_portfolio(pf: &Portfolio) -> Self {
        Self {
            equity_curve: pf.equity_curve().to_vec(),
            trades: pf.closed_trades().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_deterministic_for_same_config() {
        let a = run_id(r#"{"symbol":"EURUSD"}"#);
        let b = run_id(r#"{"symbol":"EURUSD"}"#);
        assert_eq!(a, b);
        let c = run_id(r#"{"symbol":"GBPUSD"}"#);
        assert_ne!(a, c);
    }

    #[test]
    fn writer_produces_readable_files() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(tmp.path(), "run_abc").unwrap();
        writer
            .write_warnings(&["warmup truncated".to_string()])
            .unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("runs/run_abc/warnings.json")).unwrap();
        assert!(contents.contains("warmup truncated"));
        assert!(!tmp.path().join("runs/run_abc/warnings.json.tmp").exists());
    }
}
