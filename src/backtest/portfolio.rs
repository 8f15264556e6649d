//! Portfolio accounting: positions, equity curve, MAE/MFE, SL/TP exits,
//! and high-water-mark bookkeeping (spec.md §4.4).

use crate::domain::{EquityPoint, ExitReason, Position, PositionSide, TradeRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Positions are keyed by (symbol, bot), matching spec.md §3.
type PositionKey = (String, String);

pub struct Portfolio {
    initial_cash: f64,
    cash: f64,
    realized_pnl: f64,
    positions: HashMap<PositionKey, Position>,
    closed_trades: Vec<TradeRecord>,
    equity_curve: Vec<EquityPoint>,
    high_water_mark: f64,
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            realized_pnl: 0.0,
            positions: HashMap::new(),
            closed_trades: Vec::new(),
            equity_curve: Vec::new(),
            high_water_mark: initial_cash,
        }
    }

    /// Restores the portfolio to its just-constructed state exactly
    /// (spec.md §4.4 "Reset restores the initial state exactly").
    pub fn reset(&mut self) {
        self.cash = self.initial_cash;
        self.realized_pnl = 0.0;
        self.positions.clear();
        self.closed_trades.clear();
        self.equity_curve.clear();
        self.high_water_mark = self.initial_cash;
    }

    pub fn open_position(&mut self, bot: &str, position: Position) {
        self.positions.insert((position.symbol.clone(), bot.to_string()), position);
    }

    pub fn position(&self, symbol: &str, bot: &str) -> Option<&Position> {
        self.positions.get(&(symbol.to_string(), bot.to_string()))
    }

    pub fn has_position(&self, symbol: &str, bot: &str) -> bool {
        self.positions.contains_key(&(symbol.to_string(), bot.to_string()))
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn closed_trades(&self) -> &[TradeRecord] {
        &self.closed_trades
    }

    /// Recomputes unrealized PnL for every open position from the current
    /// bar's close prices, updating each position's running MAE/MFE.
    pub fn update_prices(&mut self, prices: &HashMap<String, f64>) {
        for (key, pos) in self.positions.iter_mut() {
            if let Some(price) = prices.get(&key.0) {
                pos.update_price(*price);
            }
        }
    }

    pub fn increment_bars_held(&mut self) {
        for pos in self.positions.values_mut() {
            pos.bars_held += 1;
        }
    }

    /// Closes any position whose SL/TP would trigger at `prices`, returning
    /// the generated trade records. Called once per bar, before strategy
    /// invocation (spec.md §4.6 step 2).
    pub fn check_exits(&mut self, prices: &HashMap<String, f64>, now: DateTime<Utc>, fee: f64) -> Vec<TradeRecord> {
        let mut to_close: Vec<(PositionKey, f64, ExitReason)> = Vec::new();
        for (key, pos) in self.positions.iter() {
            if let Some(price) = prices.get(&key.0) {
                if let Some(reason) = pos.check_exit(*price) {
                    to_close.push((key.clone(), *price, reason));
                }
            }
        }
        let mut trades = Vec::new();
        for (key, price, reason) in to_close {
            if let Some(trade) = self.close_position_internal(&key, price, now, reason, fee) {
                trades.push(trade);
            }
        }
        trades
    }

    /// Closes a position at `price` for any reason (signal reversal, manual
    /// close, SL/TP). Returns the trade record if a position existed.
    pub fn close_position(
        &mut self,
        symbol: &str,
        bot: &str,
        price: f64,
        now: DateTime<Utc>,
        reason: ExitReason,
        fee: f64,
    ) -> Option<TradeRecord> {
        self.close_position_internal(&(symbol.to_string(), bot.to_string()), price, now, reason, fee)
    }

    fn close_position_internal(
        &mut self,
        key: &PositionKey,
        price: f64,
        now: DateTime<Utc>,
        reason: ExitReason,
        fee: f64,
    ) -> Option<TradeRecord> {
        let pos = self.positions.remove(key)?;
        let pnl = match pos.side {
            PositionSide::Long => (price - pos.entry_price) * pos.size,
            PositionSide::Short => (pos.entry_price - price) * pos.size,
        };
        self.cash += pnl - fee;
        self.realized_pnl += pnl;
        let trade = TradeRecord {
            symbol: pos.symbol.clone(),
            bot: pos.bot.clone(),
            side: pos.side,
            size: pos.size,
            entry_price: pos.entry_price,
            exit_price: price,
            entry_time: pos.entry_time,
            exit_time: now,
            pnl: pnl - fee,
            fees: fee,
            mae: pos.mae,
            mfe: pos.mfe,
            bars_held: pos.bars_held,
            exit_reason: reason,
        };
        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.unrealized_pnl()
    }

    /// Appends one equity point, maintaining the monotone-non-decreasing
    /// high-water-mark invariant (spec.md §3, §8).
    pub fn record_equity_point(&mut self, timestamp: DateTime<Utc>) {
        let equity = self.equity();
        self.high_water_mark = self.high_water_mark.max(equity);
        let drawdown = (self.high_water_mark - equity).max(0.0);
        let drawdown_pct = if self.high_water_mark > 0.0 {
            drawdown / self.high_water_mark
        } else {
            0.0
        };
        self.equity_curve.push(EquityPoint {
            timestamp,
            equity,
            cash: self.cash,
            unrealized_pnl: self.unrealized_pnl(),
            realized_pnl: self.realized_pnl,
            drawdown,
            drawdown_pct,
            high_water_mark: self.high_water_mark,
        });
    }
}
