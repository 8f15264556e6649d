//! Per-fold combo performance aggregation and consistency ranking
//! (spec.md §3 "Combo Performance", §4.7).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum RankMetric {
    Sharpe,
    Sortino,
    WinRate,
    ProfitFactor,
    Calmar,
    Composite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct ComboKey {
    pub symbol: String,
    pub bot: String,
    pub timeframe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboPerformance {
    pub combo: ComboKey,
    pub window_id: usize,
    pub is_oos: IsOos,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
    pub trades: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsOos {
    InSample,
    OutOfSample,
}

impl ComboPerformance {
    fn rank_value(&self, metric: RankMetric) -> f64 {
        match metric {
            RankMetric::Sharpe => self.sharpe,
            RankMetric::Sortino => self.sortino,
            RankMetric::WinRate => self.win_rate,
            RankMetric::ProfitFactor => self.profit_factor,
            RankMetric::Calmar => {
                if self.max_drawdown_pct.abs() > 1e-9 {
                    self.return_pct / self.max_drawdown_pct
                } else {
                    0.0
                }
            }
            RankMetric::Composite => {
                0.4 * self.sharpe + 0.3 * self.win_rate + 0.3 * self.profit_factor.min(5.0)
            }
        }
    }
}

/// Ranks in-sample results for one fold and returns the top `n` combos by
/// `metric`, descending.
pub fn rank_top_n(is_results: &[ComboPerformance], metric: RankMetric, n: usize) -> Vec<ComboKey> {
    let mut sorted: Vec<&ComboPerformance> = is_results.iter().collect();
    sorted.sort_by(|a, b| b.rank_value(metric).partial_cmp(&a.rank_value(metric)).unwrap());
    sorted.into_iter().take(n).map(|r| r.combo.clone()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboAggregate {
    pub combo: ComboKey,
    pub mean_oos_sharpe: f64,
    pub stddev_oos_sharpe: f64,
    pub pct_folds_profitable: f64,
    /// mean(Sharpe) / max(stddev(Sharpe), 0.1); the 0.1 floor keeps a combo
    /// with near-zero variance from producing an unbounded score.
    pub consistency_score: f64,
    pub folds_evaluated: usize,
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn stddev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64).sqrt()
}

/// Aggregates OOS results across folds per combo. Per spec.md §4.7/§9,
/// aggregation requires at least 2 folds; combos with fewer OOS
/// observations are excluded rather than silently scored on N=1.
pub fn aggregate_oos(results: &[ComboPerformance]) -> Vec<ComboAggregate> {
    let mut by_combo: HashMap<ComboKey, Vec<&ComboPerformance>> = HashMap::new();
    for r in results.iter().filter(|r| r.is_oos == IsOos::OutOfSample) {
        by_combo.entry(r.combo.clone()).or_default().push(r);
    }

    let mut aggregates = Vec::new();
    for (combo, rows) in by_combo {
        if rows.len() < 2 {
            continue;
        }
        let sharpes: Vec<f64> = rows.iter().map(|r| r.sharpe).collect();
        let profitable = rows.iter().filter(|r| r.return_pct > 0.0).count();
        let mean_sharpe = mean(&sharpes);
        let sd = stddev(&sharpes);
        aggregates.push(ComboAggregate {
            combo,
            mean_oos_sharpe: mean_sharpe,
            stddev_oos_sharpe: sd,
            pct_folds_profitable: profitable as f64 / rows.len() as f64,
            consistency_score: mean_sharpe / sd.max(0.1),
            folds_evaluated: rows.len(),
        });
    }

    aggregates.sort_by(|a, b| b.consistency_score.partial_cmp(&a.consistency_score).unwrap());
    aggregates
}
