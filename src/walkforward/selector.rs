//! Combo selector (spec.md §2 overview "Combo selector": filter + diversity
//! + rationale), applied to a walk-forward aggregate to produce the final
//! recommendations table.

use crate::walkforward::aggregate::ComboAggregate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub min_consistency_score: f64,
    pub min_pct_folds_profitable: f64,
    /// Maximum combos selected per symbol, so one instrument's strongest
    /// bot doesn't crowd out diversification across symbols.
    pub max_per_symbol: usize,
    pub max_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub combo: crate::walkforward::aggregate::ComboKey,
    pub consistency_score: f64,
    pub rationale: String,
}

/// Filters aggregates by the minimum thresholds, then walks them in
/// consistency-score order applying a per-symbol diversity cap, recording a
/// short rationale for each pick.
pub fn select_combos(aggregates: &[ComboAggregate], criteria: &SelectionCriteria) -> Vec<Recommendation> {
    let mut sorted: Vec<&ComboAggregate> = aggregates
        .iter()
        .filter(|a| {
            a.consistency_score >= criteria.min_consistency_score
                && a.pct_folds_profitable >= criteria.min_pct_folds_profitable
        })
        .collect();
    sorted.sort_by(|a, b| b.consistency_score.partial_cmp(&a.consistency_score).unwrap());

    let mut per_symbol_count: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut picks = Vec::new();

    for agg in sorted {
        if picks.len() >= criteria.max_total {
            break;
        }
        let key = (agg.combo.symbol.clone(), agg.combo.bot.clone(), agg.combo.timeframe.clone());
        if seen.contains(&key) {
            continue;
        }
        let count = per_symbol_count.entry(agg.combo.symbol.clone()).or_insert(0);
        if *count >= criteria.max_per_symbol {
            continue;
        }
        *count += 1;
        seen.insert(key);
        picks.push(Recommendation {
            combo: agg.combo.clone(),
            consistency_score: agg.consistency_score,
            rationale: format!(
                "consistency_score={:.2}, profitable in {:.0}% of {} folds",
                agg.consistency_score,
                agg.pct_folds_profitable * 100.0,
                agg.folds_evaluated
            ),
        });
    }

    picks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walkforward::aggregate::ComboKey;

    fn agg(symbol: &str, bot: &str, score: f64, pct: f64) -> ComboAggregate {
        ComboAggregate {
            combo: ComboKey {
                symbol: symbol.to_string(),
                bot: bot.to_string(),
                timeframe: "H1".to_string(),
            },
            mean_oos_sharpe: score,
            stddev_oos_sharpe: 0.2,
            pct_folds_profitable: pct,
            consistency_score: score,
            folds_evaluated: 4,
        }
    }

    #[test]
    fn filters_below_threshold() {
        let aggregates = vec![agg("EURUSD", "bot1", 0.5, 0.8), agg("EURUSD", "bot2", 2.0, 0.9)];
        let criteria = SelectionCriteria {
            min_consistency_score: 1.0,
            min_pct_folds_profitable: 0.5,
            max_per_symbol: 5,
            max_total: 10,
        };
        let picks = select_combos(&aggregates, &criteria);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].combo.bot, "bot2");
    }

    #[test]
    fn respects_per_symbol_diversity_cap() {
        let aggregates = vec![
            agg("EURUSD", "bot1", 3.0, 0.9),
            agg("EURUSD", "bot2", 2.5, 0.9),
            agg("EURUSD", "bot3", 2.0, 0.9),
            agg("GBPUSD", "bot4", 1.8, 0.9),
        ];
        let criteria = SelectionCriteria {
            min_consistency_score: 0.0,
            min_pct_folds_profitable: 0.0,
            max_per_symbol: 1,
            max_total: 10,
        };
        let picks = select_combos(&aggregates, &criteria);
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].combo.bot, "bot1");
        assert_eq!(picks[1].combo.bot, "bot4");
    }
}
