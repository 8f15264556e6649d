//! Sweep combo identity: the Cartesian product of bots x symbols x
//! timeframes x (start, end) windows, each combo keyed by a stable 16-hex
//! id derived from its own parameters, the whole sweep keyed by a request
//! hash derived from the full grid (spec.md §4.7).

use crate::domain::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComboSpec {
    pub bot: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ComboSpec {
    /// Stable 16-hex-char id derived from the combo's own parameters.
    pub fn combo_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bot.as_bytes());
        hasher.update(self.symbol.as_bytes());
        hasher.update(self.timeframe.as_str().as_bytes());
        hasher.update(self.start.to_rfc3339().as_bytes());
        hasher.update(self.end.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

/// Cartesian product of the sweep's axes, in deterministic (not shuffled)
/// order; callers may shuffle the result for load balancing (spec.md §4.7).
pub fn cartesian_product(
    bots: &[String],
    symbols: &[String],
    timeframes: &[Timeframe],
    windows: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<ComboSpec> {
    let mut combos = Vec::with_capacity(bots.len() * symbols.len() * timeframes.len() * windows.len());
    for bot in bots {
        for symbol in symbols {
            for timeframe in timeframes {
                for (start, end) in windows {
                    combos.push(ComboSpec {
                        bot: bot.clone(),
                        symbol: symbol.clone(),
                        timeframe: *timeframe,
                        start: *start,
                        end: *end,
                    });
                }
            }
        }
    }
    combos
}

/// A request hash that deterministically identifies a sweep configuration,
/// used to decide whether an on-disk sweep directory can be resumed.
pub fn request_hash(bots: &[String], symbols: &[String], timeframes: &[Timeframe], windows: &[(DateTime<Utc>, DateTime<Utc>)]) -> String {
    let mut hasher = Sha256::new();
    for bot in bots {
        hasher.update(bot.as_bytes());
    }
    for symbol in symbols {
        hasher.update(symbol.as_bytes());
    }
    for tf in timeframes {
        hasher.update(tf.as_str().as_bytes());
    }
    for (start, end) in windows {
        hasher.update(start.to_rfc3339().as_bytes());
        hasher.update(end.to_rfc3339().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn combo_id_is_stable_16_hex_chars() {
        let spec = ComboSpec {
            bot: "TKCrossSniper".to_string(),
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::H1,
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-02-01T00:00:00Z"),
        };
        let id = spec.combo_id();
        assert_eq!(id.len(), 16);
        assert_eq!(id, spec.combo_id());
    }

    #[test]
    fn cartesian_product_covers_full_grid() {
        let combos = cartesian_product(
            &["bot1".to_string(), "bot2".to_string()],
            &["EURUSD".to_string()],
            &[Timeframe::H1, Timeframe::M15],
            &[(ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z"))],
        );
        assert_eq!(combos.len(), 4);
    }

    #[test]
    fn request_hash_changes_with_grid_contents() {
        let h1 = request_hash(&["bot".to_string()], &["EURUSD".to_string()], &[Timeframe::H1], &[]);
        let h2 = request_hash(&["bot".to_string()], &["GBPUSD".to_string()], &[Timeframe::H1], &[]);
        assert_ne!(h1, h2);
    }
}
