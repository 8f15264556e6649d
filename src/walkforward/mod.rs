//! Walk-forward optimization: fold generation, per-fold IS/OOS sweeps, OOS
//! aggregation and combo selection (spec.md §4.7).

pub mod aggregate;
pub mod folds;
pub mod optimizer;
pub mod selector;

pub use aggregate::{aggregate_oos, rank_top_n, ComboAggregate, ComboKey, ComboPerformance, IsOos, RankMetric};
pub use folds::{generate_folds, oos_windows_are_non_overlapping, Fold, FoldMode, Window};
pub use optimizer::{FoldScorecard, MetricsExtractor, WalkForwardOptimizer, WalkForwardRequest};
pub use selector::{select_combos, Recommendation, SelectionCriteria};
