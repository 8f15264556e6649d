//! OHLCV bar and timeframe types (spec.md §3 "Bar").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
        }
    }

    /// Higher timeframes derivable from 1-minute bars, in spec.md §4.17
    /// boundary order.
    pub fn derived_from_m1() -> [Timeframe; 4] {
        [Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4]
    }
}

/// Error returned when a bar fails the OHLC structural invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarValidationError {
    #[error("non-positive OHLCV value")]
    NonPositive,
    #[error("high {high} is below max(open, close, low)")]
    HighTooLow { high: String },
    #[error("low {low} is above min(open, close, high)")]
    LowTooHigh { low: String },
    #[error("timestamp {0} is not aligned to the {1:?} boundary")]
    Unaligned(DateTime<Utc>, Timeframe),
}

/// A single OHLCV bar, immutable once constructed and stored.
///
/// Keyed by (symbol, timeframe, timestamp); writing a bar with an existing
/// key replaces it (dedup semantics live in the store, not here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self {
            symbol: symbol.into(),
            timeframe,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }

    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0
            || self.high <= 0.0
            || self.low <= 0.0
            || self.close <= 0.0
            || self.volume < 0.0
        {
            return Err(BarValidationError::NonPositive);
        }
        let max_oc_l = self.open.max(self.close).max(self.low);
        if self.high < max_oc_l {
            return Err(BarValidationError::HighTooLow {
                high: self.high.to_string(),
            });
        }
        let min_oc_h = self.open.min(self.close).min(self.high);
        if self.low > min_oc_h {
            return Err(BarValidationError::LowTooHigh {
                low: self.low.to_string(),
            });
        }
        Ok(())
    }

    pub fn key(&self) -> (String, Timeframe, DateTime<Utc>) {
        (self.symbol.clone(), self.timeframe, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn rejects_high_below_close() {
        let err = Bar::new("EURUSD", Timeframe::M1, ts(), 1.0, 1.01, 0.99, 1.05, 100.0)
            .unwrap_err();
        assert_eq!(
            err,
            BarValidationError::HighTooLow {
                high: "1.01".to_string()
            }
        );
    }

    #[test]
    fn rejects_non_positive_volume() {
        let err = Bar::new("EURUSD", Timeframe::M1, ts(), 1.0, 1.01, 0.99, 1.0, -1.0)
            .unwrap_err();
        assert_eq!(err, BarValidationError::NonPositive);
    }

    #[test]
    fn accepts_well_formed_bar() {
        let bar = Bar::new("EURUSD", Timeframe::M1, ts(), 1.0, 1.02, 0.98, 1.01, 1200.0).unwrap();
        assert_eq!(bar.close, 1.01);
    }
}
