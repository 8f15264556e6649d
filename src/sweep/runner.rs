//! Resumable parallel sweep runner (spec.md §4.7): a multi-binary
//! `[[bin]]` pattern for process isolation (a `combo-worker` binary runs
//! exactly one combo and exits) with atomic-write/content-hash
//! checkpointing so an interrupted sweep resumes without rerunning
//! completed combos.

use crate::sweep::combo::ComboSpec;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboResult {
    pub combo_id: String,
    pub spec: ComboSpec,
    pub status: ComboStatus,
    pub metrics: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComboStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepManifest {
    pub sweep_id: String,
    pub request_hash: String,
    pub total_combos: usize,
    pub completed_combos: usize,
    pub status: SweepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepStatus {
    Running,
    Completed,
}

/// Runs one combo to completion. The production implementation spawns the
/// `combo-worker` binary as an isolated OS process (§5 "processes, not
/// threads"); tests substitute an in-process executor.
#[async_trait]
pub trait ComboExecutor: Send + Sync {
    async fn execute(&self, combo: &ComboSpec) -> Result<serde_json::Value, String>;
}

/// Spawns `combo-worker --combo <json>` as a child process per combo.
pub struct ProcessComboExecutor {
    pub worker_binary: PathBuf,
}

#[async_trait]
impl ComboExecutor for ProcessComboExecutor {
    async fn execute(&self, combo: &ComboSpec) -> Result<serde_json::Value, String> {
        let payload = serde_json::to_string(combo).map_err(|e| e.to_string())?;
        let output = tokio::process::Command::new(&self.worker_binary)
            .arg("--combo")
            .arg(payload)
            .output()
            .await
            .map_err(|e| format!("failed to spawn combo-worker: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "combo-worker exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| format!("malformed combo-worker output: {e}"))
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        let json = serde_json::to_vec_pretty(value)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

pub struct SweepRunner {
    sweep_dir: PathBuf,
    executor: Arc<dyn ComboExecutor>,
    concurrency: usize,
    per_combo_timeout: Duration,
    shuffle: bool,
}

impl SweepRunner {
    pub fn new(sweep_dir: impl Into<PathBuf>, executor: Arc<dyn ComboExecutor>) -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            sweep_dir: sweep_dir.into(),
            executor,
            concurrency: available.saturating_sub(1).max(1),
            per_combo_timeout: Duration::from_secs(300),
            shuffle: false,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_combo_timeout = timeout;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    fn combos_dir(&self) -> PathBuf {
        self.sweep_dir.join("combos")
    }

    fn manifest_path(&self) -> PathBuf {
        self.sweep_dir.join("manifest.json")
    }

    fn load_manifest(&self) -> Option<SweepManifest> {
        let contents = std::fs::read_to_string(self.manifest_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Runs `combos` under this sweep directory. If `resume` is true and an
    /// existing manifest matches `request_hash` and isn't completed, any
    /// combo file already present is treated as done and skipped; otherwise
    /// a fresh sweep directory is (re)initialized.
    pub async fn run(&self, combos: Vec<ComboSpec>, request_hash: &str, resume: bool) -> std::io::Result<Vec<ComboResult>> {
        std::fs::create_dir_all(self.combos_dir())?;

        let adopt_existing = resume
            && self
                .load_manifest()
                .map(|m| m.request_hash == request_hash && m.status != SweepStatus::Completed)
                .unwrap_or(false);

        let mut done_ids: HashSet<String> = HashSet::new();
        if adopt_existing {
            if let Ok(entries) = std::fs::read_dir(self.combos_dir()) {
                for entry in entries.flatten() {
                    if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                        done_ids.insert(stem.to_string());
                    }
                }
            }
        } else {
            // Fresh sweep: clear any stale combo files from a previous,
            // differently-hashed request.
            if self.combos_dir().exists() {
                for entry in std::fs::read_dir(self.combos_dir())?.flatten() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        let mut ordered = combos;
        if self.shuffle {
            ordered.shuffle(&mut rand::thread_rng());
        }

        let total = ordered.len();
        atomic_write_json(
            &self.manifest_path(),
            &SweepManifest {
                sweep_id: request_hash.to_string(),
                request_hash: request_hash.to_string(),
                total_combos: total,
                completed_combos: done_ids.len(),
                status: SweepStatus::Running,
            },
        )?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();
        let mut results: Vec<ComboResult> = Vec::new();

        for combo in ordered {
            let combo_id = combo.combo_id();
            if done_ids.contains(&combo_id) {
                if let Ok(contents) = std::fs::read_to_string(self.combos_dir().join(format!("{combo_id}.json"))) {
                    if let Ok(result) = serde_json::from_str::<ComboResult>(&contents) {
                        results.push(result);
                        continue;
                    }
                }
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let executor = self.executor.clone();
            let timeout = self.per_combo_timeout;
            let combos_dir = self.combos_dir();
            let combo_for_task = combo.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = tokio::time::timeout(timeout, executor.execute(&combo_for_task)).await;
                let result = match outcome {
                    Ok(Ok(metrics)) => ComboResult {
                        combo_id: combo_for_task.combo_id(),
                        spec: combo_for_task.clone(),
                        status: ComboStatus::Completed,
                        metrics: Some(metrics),
                        error: None,
                    },
                    Ok(Err(err)) => ComboResult {
                        combo_id: combo_for_task.combo_id(),
                        spec: combo_for_task.clone(),
                        status: ComboStatus::Failed,
                        metrics: None,
                        error: Some(err),
                    },
                    Err(_elapsed) => ComboResult {
                        combo_id: combo_for_task.combo_id(),
                        spec: combo_for_task.clone(),
                        status: ComboStatus::TimedOut,
                        metrics: None,
                        error: Some("combo execution timed out".to_string()),
                    },
                };
                let path = combos_dir.join(format!("{}.json", result.combo_id));
                let _ = atomic_write_json(&path, &result);
                result
            }));
        }

        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }

        atomic_write_json(
            &self.manifest_path(),
            &SweepManifest {
                sweep_id: request_hash.to_string(),
                request_hash: request_hash.to_string(),
                total_combos: total,
                completed_combos: results.len(),
                status: SweepStatus::Completed,
            },
        )?;

        Ok(results)
    }
}
