//! Strategy interface: a pure function from bars to a signal (spec.md §1
//! "Out of scope: Strategy mathematics themselves"). The backtest engine and
//! autopilot depend only on this trait; concrete strategy math is a
//! deployment concern, not this crate's.

use crate::domain::{Bar, PositionSide, SignalIntent};

/// Given the full bar history up to and including the current bar, and an
/// optional current-position hint, produce a signal. Implementations must
/// not look ahead: `bars` is already truncated to `[0..=current_index]` by
/// the caller.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn generate_signal(&self, bars: &[Bar], current_position: Option<PositionSide>) -> SignalIntent;
}

/// A strategy that always holds; used in tests and as a safe placeholder
/// when wiring a combo whose real strategy isn't registered yet.
pub struct HoldStrategy {
    name: String,
}

impl HoldStrategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Strategy for HoldStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signal(&self, _bars: &[Bar], _current_position: Option<PositionSide>) -> SignalIntent {
        SignalIntent::hold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_strategy_never_signals_entry() {
        let strat = HoldStrategy::new("noop");
        let signal = strat.generate_signal(&[], None);
        assert!(!signal.direction.is_entry());
    }
}
