//! Position, equity point and trade record types (spec.md §3 "Position",
//! "Equity Point").

use super::signal::PositionSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub bot: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub unrealized_pnl: f64,
    /// Maximum Adverse Excursion: the worst (most negative) unrealized PnL
    /// observed so far.
    pub mae: f64,
    /// Maximum Favorable Excursion: the best unrealized PnL observed so far.
    pub mfe: f64,
    pub bars_held: u64,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        bot: impl Into<String>,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bot: bot.into(),
            side,
            size,
            entry_price,
            entry_time,
            stop_loss,
            take_profit,
            unrealized_pnl: 0.0,
            mae: 0.0,
            mfe: 0.0,
            bars_held: 0,
        }
    }

    /// Recomputes unrealized PnL from the current price and folds it into
    /// the running MAE/MFE bounds. Returns the new unrealized PnL.
    pub fn update_price(&mut self, price: f64) -> f64 {
        let pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
        };
        self.unrealized_pnl = pnl;
        self.mae = self.mae.min(pnl);
        self.mfe = self.mfe.max(pnl);
        pnl
    }

    /// Checks whether the position's SL or TP would trigger at `price`;
    /// returns the exit price if so (spec.md §4.4 `check_exits`).
    pub fn check_exit(&self, price: f64) -> Option<ExitReason> {
        match self.side {
            PositionSide::Long => {
                if let Some(sl) = self.stop_loss {
                    if price <= sl {
                        return Some(ExitReason::StopLoss);
                    }
                }
                if let Some(tp) = self.take_profit {
                    if price >= tp {
                        return Some(ExitReason::TakeProfit);
                    }
                }
            }
            PositionSide::Short => {
                if let Some(sl) = self.stop_loss {
                    if price >= sl {
                        return Some(ExitReason::StopLoss);
                    }
                }
                if let Some(tp) = self.take_profit {
                    if price <= tp {
                        return Some(ExitReason::TakeProfit);
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SignalReversal,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub bot: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub fees: f64,
    pub mae: f64,
    pub mfe: f64,
    pub bars_held: u64,
    pub exit_reason: ExitReason,
}

/// One point on the equity curve. `high_water_mark` must be monotone
/// non-decreasing across the curve (spec.md §3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
    pub high_water_mark: f64,
}
