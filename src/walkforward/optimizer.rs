//! Walk-forward optimizer orchestration (spec.md §4.7): for each fold, sweep
//! the in-sample window, rank and take the top-N, rerun those combos on the
//! out-of-sample window, then aggregate across folds.

use crate::sweep::{cartesian_product, ComboExecutor, ComboSpec, ComboStatus, SweepRunner};
use crate::walkforward::aggregate::{aggregate_oos, rank_top_n, ComboAggregate, ComboKey, ComboPerformance, IsOos, RankMetric};
use crate::walkforward::folds::{generate_folds, Fold, FoldMode};
use std::path::PathBuf;
use std::sync::Arc;

pub struct WalkForwardRequest {
    pub bots: Vec<String>,
    pub symbols: Vec<String>,
    pub timeframes: Vec<crate::domain::Timeframe>,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub is_days: i64,
    pub oos_days: i64,
    pub step_days: i64,
    pub mode: FoldMode,
    pub rank_metric: RankMetric,
    pub top_n: usize,
}

pub struct FoldScorecard {
    pub fold: Fold,
    pub is_results: Vec<ComboPerformance>,
    pub oos_results: Vec<ComboPerformance>,
}

/// A metrics extractor turns a completed combo's raw sweep output into a
/// `ComboPerformance` row; the optimizer doesn't know how metrics.json is
/// shaped internally, only that the sweep runner hands back a JSON value.
pub type MetricsExtractor = Arc<dyn Fn(&ComboSpec, &serde_json::Value) -> ComboPerformance + Send + Sync>;

pub struct WalkForwardOptimizer {
    sweep_root: PathBuf,
    executor: Arc<dyn ComboExecutor>,
    extractor: MetricsExtractor,
}

impl WalkForwardOptimizer {
    pub fn new(sweep_root: impl Into<PathBuf>, executor: Arc<dyn ComboExecutor>, extractor: MetricsExtractor) -> Self {
        Self {
            sweep_root: sweep_root.into(),
            executor,
            extractor,
        }
    }

    pub async fn run(&self, request: &WalkForwardRequest) -> std::io::Result<(Vec<FoldScorecard>, Vec<ComboAggregate>)> {
        let folds = generate_folds(
            request.start,
            request.end,
            request.is_days,
            request.oos_days,
            request.step_days,
            request.mode,
        );

        let mut scorecards = Vec::new();

        for fold in folds {
            let is_combos = cartesian_product(
                &request.bots,
                &request.symbols,
                &request.timeframes,
                &[(fold.in_sample.start, fold.in_sample.end)],
            );
            let is_sweep_dir = self.sweep_root.join(format!("fold_{}_is", fold.window_id));
            let is_runner = SweepRunner::new(&is_sweep_dir, self.executor.clone());
            let is_hash = format!("fold-{}-is", fold.window_id);
            let is_raw = is_runner.run(is_combos, &is_hash, true).await?;

            let is_results: Vec<ComboPerformance> = is_raw
                .iter()
                .filter(|r| r.status == ComboStatus::Completed)
                .filter_map(|r| r.metrics.as_ref().map(|m| (self.extractor)(&r.spec, m)))
                .map(|mut p| {
                    p.is_oos = IsOos::InSample;
                    p.window_id = fold.window_id;
                    p
                })
                .collect();

            let top: Vec<ComboKey> = rank_top_n(&is_results, request.rank_metric, request.top_n);

            let oos_combos: Vec<ComboSpec> = top
                .iter()
                .map(|key| ComboSpec {
                    bot: key.bot.clone(),
                    symbol: key.symbol.clone(),
                    timeframe: request
                        .timeframes
                        .iter()
                        .find(|tf| tf.as_str() == key.timeframe)
                        .copied()
                        .unwrap_or(request.timeframes[0]),
                    start: fold.out_of_sample.start,
                    end: fold.out_of_sample.end,
                })
                .collect();

            let oos_sweep_dir = self.sweep_root.join(format!("fold_{}_oos", fold.window_id));
            let oos_runner = SweepRunner::new(&oos_sweep_dir, self.executor.clone());
            let oos_hash = format!("fold-{}-oos", fold.window_id);
            let oos_raw = oos_runner.run(oos_combos, &oos_hash, true).await?;

            let oos_results: Vec<ComboPerformance> = oos_raw
                .iter()
                .filter(|r| r.status == ComboStatus::Completed)
                .filter_map(|r| r.metrics.as_ref().map(|m| (self.extractor)(&r.spec, m)))
                .map(|mut p| {
                    p.is_oos = IsOos::OutOfSample;
                    p.window_id = fold.window_id;
                    p
                })
                .collect();

            scorecards.push(FoldScorecard {
                fold,
                is_results,
                oos_results,
            });
        }

        let all_oos: Vec<ComboPerformance> = scorecards.iter().flat_map(|s| s.oos_results.clone()).collect();
        let aggregates = aggregate_oos(&all_oos);

        Ok((scorecards, aggregates))
    }
}
