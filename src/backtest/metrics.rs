//! Performance ratio computation (spec.md §4.5): Sharpe/Sortino/Calmar
//! and trade statistics derived from an equity curve and closed trades.

use crate::domain::{EquityPoint, TradeRecord};
use serde::{Deserialize, Serialize};

/// Capped sentinel used in place of an unbounded ratio (spec.md §4.5).
const SHARPE_SENTINEL: f64 = 99.99;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
/// Bars per day at the 1-minute timeframe (24h * 60m); callers on a
/// higher-TF-only backtest must supply their own `bars_per_day`.
pub const BARS_PER_DAY_1M: f64 = 1_440.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MaxDrawdown {
    pub absolute: f64,
    pub percent: f64,
    /// Duration in bars; resets on each new high-water mark.
    pub duration_bars: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub max_drawdown: MaxDrawdownScalar,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub average_bars_held: f64,
    pub time_in_market_ratio: f64,
    pub total_trades: usize,
    pub total_return_pct: f64,
}

/// `MaxDrawdown` without the non-`Default` duration-reset bookkeeping, kept
/// as a flat field set so `PerformanceMetrics` derives `Default` cleanly.
pub type MaxDrawdownScalar = MaxDrawdown;

fn bar_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .map(|w| {
            if w[0].equity.abs() > 1e-12 {
                (w[1].equity - w[0].equity) / w[0].equity
            } else {
                0.0
            }
        })
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn stdev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Sharpe = (mean_ret - rf) / std_ret * sqrt(periods_per_year). Zero stdev
/// with positive excess returns a capped sentinel; zero stdev and zero
/// excess is 0 (spec.md §4.5).
pub fn sharpe_ratio(returns: &[f64], risk_free_per_period: f64, periods_per_year: f64) -> f64 {
    let m = mean(returns);
    let sd = stdev(returns);
    let excess = m - risk_free_per_period;
    if sd <= 1e-12 {
        return if excess > 0.0 { SHARPE_SENTINEL } else { 0.0 };
    }
    (excess / sd) * periods_per_year.sqrt()
}

/// Sortino uses downside-only stdev; no negative returns and positive
/// excess yields a +infinity sentinel (spec.md §4.5).
pub fn sortino_ratio(returns: &[f64], risk_free_per_period: f64, periods_per_year: f64) -> f64 {
    let m = mean(returns);
    let excess = m - risk_free_per_period;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return if excess > 0.0 { f64::INFINITY } else { 0.0 };
    }
    let downside_sd = {
        let ms = mean(&downside.iter().map(|r| r.powi(2)).collect::<Vec<_>>());
        ms.sqrt()
    };
    if downside_sd <= 1e-12 {
        return if excess > 0.0 { SHARPE_SENTINEL } else { 0.0 };
    }
    (excess / downside_sd) * periods_per_year.sqrt()
}

/// Max drawdown in absolute and percent terms, plus duration in bars;
/// duration resets every time a new high-water mark is set.
pub fn max_drawdown(curve: &[EquityPoint]) -> MaxDrawdown {
    let mut worst = MaxDrawdown::default();
    let mut duration = 0u64;
    let mut prev_hwm = f64::NEG_INFINITY;
    for point in curve {
        if point.high_water_mark > prev_hwm {
            duration = 0;
            prev_hwm = point.high_water_mark;
        } else {
            duration += 1;
        }
        if point.drawdown > worst.absolute {
            worst = MaxDrawdown {
                absolute: point.drawdown,
                percent: point.drawdown_pct,
                duration_bars: duration,
            };
        } else if point.drawdown == worst.absolute && duration > worst.duration_bars {
            worst.duration_bars = duration;
        }
    }
    worst
}

/// CAGR / max_drawdown_pct. If max drawdown is ~0, returns the sentinel to
/// avoid division blowup (consistent with the other ratio sentinels).
pub fn calmar_ratio(cagr: f64, max_dd_pct: f64) -> f64 {
    if max_dd_pct.abs() <= 1e-9 {
        return if cagr > 0.0 { SHARPE_SENTINEL } else { 0.0 };
    }
    cagr / max_dd_pct
}

/// CAGR from an equity curve's start/end equity and elapsed bars, annualized
/// by `bars_per_day`.
pub fn cagr(start_equity: f64, end_equity: f64, bars_elapsed: f64, bars_per_day: f64) -> f64 {
    if start_equity <= 0.0 || bars_elapsed <= 0.0 {
        return 0.0;
    }
    let years = bars_elapsed / bars_per_day / 365.0;
    if years <= 0.0 {
        return 0.0;
    }
    (end_equity / start_equity).powf(1.0 / years) - 1.0
}

/// Computes the full metrics bundle for one (equity curve, trade list) pair.
/// `bars_per_day` defaults to `BARS_PER_DAY_1M` for 1-minute backtests;
/// callers on higher timeframes must supply their own.
pub fn compute_metrics(curve: &[EquityPoint], trades: &[TradeRecord], bars_per_day: f64) -> PerformanceMetrics {
    let returns = bar_returns(curve);
    let periods_per_year = TRADING_DAYS_PER_YEAR * bars_per_day;
    let sharpe = sharpe_ratio(&returns, 0.0, periods_per_year);
    let sortino = sortino_ratio(&returns, 0.0, periods_per_year);
    let dd = max_drawdown(curve);

    let start_equity = curve.first().map(|p| p.equity).unwrap_or(0.0);
    let end_equity = curve.last().map(|p| p.equity).unwrap_or(start_equity);
    let total_return_pct = if start_equity > 0.0 {
        (end_equity / start_equity - 1.0) * 100.0
    } else {
        0.0
    };
    let the_cagr = cagr(start_equity, end_equity, curve.len() as f64, bars_per_day);
    let calmar = calmar_ratio(the_cagr, dd.percent);

    let wins: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losses: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl < 0.0).collect();
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins.len() as f64 / trades.len() as f64
    };
    let gross_win: f64 = wins.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.pnl.abs()).sum();
    let profit_factor = if gross_loss <= 1e-12 {
        if gross_win > 0.0 {
            SHARPE_SENTINEL
        } else {
            0.0
        }
    } else {
        gross_win / gross_loss
    };
    let average_win = if wins.is_empty() { 0.0 } else { gross_win / wins.len() as f64 };
    let average_loss = if losses.is_empty() {
        0.0
    } else {
        -gross_loss / losses.len() as f64
    };
    let largest_win = wins.iter().map(|t| t.pnl).fold(0.0_f64, f64::max);
    let largest_loss = losses.iter().map(|t| t.pnl).fold(0.0_f64, f64::min);
    let expectancy = if trades.is_empty() {
        0.0
    } else {
        trades.iter().map(|t| t.pnl).sum::<f64>() / trades.len() as f64
    };
    let average_bars_held = if trades.is_empty() {
        0.0
    } else {
        trades.iter().map(|t| t.bars_held as f64).sum::<f64>() / trades.len() as f64
    };
    let bars_in_market: u64 = trades.iter().map(|t| t.bars_held).sum();
    let time_in_market_ratio = if curve.is_empty() {
        0.0
    } else {
        (bars_in_market as f64 / curve.len() as f64).min(1.0)
    };

    PerformanceMetrics {
        sharpe,
        sortino,
        calmar,
        max_drawdown: dd,
        win_rate,
        profit_factor,
        expectancy,
        average_win,
        average_loss,
        largest_win,
        largest_loss,
        average_bars_held,
        time_in_market_ratio,
        total_trades: trades.len(),
        total_return_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExitReason;
    use chrono::{DateTime, Utc};

    fn point(equity: f64, hwm: f64) -> EquityPoint {
        let ts: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        EquityPoint {
            timestamp: ts,
            equity,
            cash: equity,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            drawdown: (hwm - equity).max(0.0),
            drawdown_pct: if hwm > 0.0 { (hwm - equity).max(0.0) / hwm } else { 0.0 },
            high_water_mark: hwm,
        }
    }

    #[test]
    fn zero_stdev_positive_excess_is_capped_sentinel() {
        let returns = vec![0.01, 0.01, 0.01];
        assert_eq!(sharpe_ratio(&returns, 0.0, 252.0), SHARPE_SENTINEL);
    }

    #[test]
    fn zero_stdev_zero_excess_is_zero() {
        let returns = vec![0.0, 0.0, 0.0];
        assert_eq!(sharpe_ratio(&returns, 0.0, 252.0), 0.0);
    }

    #[test]
    fn sortino_with_no_losses_is_infinite() {
        let returns = vec![0.01, 0.02, 0.015];
        assert!(sortino_ratio(&returns, 0.0, 252.0).is_infinite());
    }

    #[test]
    fn max_drawdown_duration_resets_on_new_high() {
        let curve = vec![
            point(100.0, 100.0),
            point(90.0, 100.0),
            point(85.0, 100.0),
            point(105.0, 105.0),
            point(95.0, 105.0),
        ];
        let dd = max_drawdown(&curve);
        assert!(dd.absolute >= 15.0 - 1e-9);
    }

    #[test]
    fn profit_factor_capped_for_zero_gross_loss() {
        let curve = vec![point(100.0, 100.0), point(110.0, 110.0)];
        let trade = TradeRecord {
            symbol: "EURUSD".into(),
            bot: "bot".into(),
            side: crate::domain::PositionSide::Long,
            size: 1.0,
            entry_price: 1.0,
            exit_price: 1.1,
            entry_time: curve[0].timestamp,
            exit_time: curve[1].timestamp,
            pnl: 10.0,
            fees: 0.0,
            mae: 0.0,
            mfe: 10.0,
            bars_held: 1,
            exit_reason: ExitReason::TakeProfit,
        };
        let metrics = compute_metrics(&curve, &[trade], BARS_PER_DAY_1M);
        assert_eq!(metrics.profit_factor, SHARPE_SENTINEL);
    }
}
