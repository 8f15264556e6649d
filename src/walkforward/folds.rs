//! Walk-forward fold generation (spec.md §4.7): rolling/anchored IS/OOS
//! windows over `[start, end)`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldMode {
    Rolling,
    Anchored,
}

/// A half-open `[start, end)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fold {
    pub window_id: usize,
    pub in_sample: Window,
    pub out_of_sample: Window,
}

/// Hard cap on fold generation, independent of how the caller's windows are
/// configured, so a misconfigured step size can't loop forever.
const MAX_ITERATIONS: usize = 10_000;

/// Generates folds per spec.md §4.7:
/// - Rolling: IS = `[current_start, current_start + is_days)`,
///   OOS = `[IS.end, IS.end + oos_days)`, `current_start += step_days`.
/// - Anchored: IS = `[overall_start, current_start + is_days)`, same OOS/step.
/// Generation stops once an OOS window would extend past `end`.
pub fn generate_folds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    is_days: i64,
    oos_days: i64,
    step_days: i64,
    mode: FoldMode,
) -> Vec<Fold> {
    let mut folds = Vec::new();
    let mut current_start = start;
    let mut window_id = 0usize;

    for _ in 0..MAX_ITERATIONS {
        let is_end = current_start + Duration::days(is_days);
        let oos_start = is_end;
        let oos_end = oos_start + Duration::days(oos_days);

        if oos_end > end {
            break;
        }

        let is_window = match mode {
            FoldMode::Rolling => Window {
                start: current_start,
                end: is_end,
            },
            FoldMode::Anchored => Window { start, end: is_end },
        };

        folds.push(Fold {
            window_id,
            in_sample: is_window,
            out_of_sample: Window {
                start: oos_start,
                end: oos_end,
            },
        });

        window_id += 1;
        current_start += Duration::days(step_days);
    }

    folds
}

/// Rolling-mode OOS intervals are pairwise non-overlapping (spec.md §8
/// "Fold monotonicity" law). Anchored-mode OOS windows are generated by the
/// same step and therefore carry the same non-overlap guarantee.
pub fn oos_windows_are_non_overlapping(folds: &[Fold]) -> bool {
    for pair in folds.windows(2) {
        if pair[0].out_of_sample.end > pair[1].out_of_sample.start {
            return false;
        }
    }
    true
}
