//! Tick-to-bar aggregation (spec.md §4.17): accumulates ticks into 1-minute
//! bars, then rolls those up into each higher timeframe boundary-aligned.
//! Per-symbol history is kept in a bounded ring so a long-running process
//! doesn't grow its bar buffer without limit.

use crate::cache::BoundedRing;
use crate::domain::{Bar, BarValidationError, Timeframe};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;

/// Bars retained per (symbol, timeframe) in memory; enough for any
/// indicator window a bot is likely to need without unbounded growth.
const BUFFER_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

struct PartialBar {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PartialBar {
    fn new(timestamp: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            timestamp,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    fn apply(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
    }

    fn finalize(&self, symbol: &str) -> Result<Bar, BarValidationError> {
        Bar::new(symbol, Timeframe::M1, self.timestamp, self.open, self.high, self.low, self.close, self.volume)
    }
}

/// Floors `ts` to the start of its containing 1-minute boundary.
fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

/// Floors `ts` to the start of the containing `timeframe` boundary, assuming
/// timeframes divide evenly into an hour or day the way the fixed set in
/// `Timeframe` does.
fn floor_to_timeframe(ts: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let minutes = timeframe.minutes();
    if minutes < 60 {
        let minute_bucket = (ts.minute() as i64 / minutes) * minutes;
        ts.with_minute(minute_bucket as u32)
            .unwrap()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap()
    } else {
        let hours = minutes / 60;
        let hour_bucket = (ts.hour() as i64 / hours) * hours;
        ts.with_hour(hour_bucket as u32)
            .unwrap()
            .with_minute(0)
            .unwrap()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap()
    }
}

struct HigherTfAccumulator {
    partial: Option<PartialBar>,
}

/// Aggregates ticks into M1 bars and rolls M1 bars up into every higher
/// timeframe `Timeframe::derived_from_m1()` names, per symbol.
pub struct BarBuilder {
    m1_partial: HashMap<String, PartialBar>,
    higher_partial: HashMap<(String, Timeframe), HigherTfAccumulator>,
    history: HashMap<(String, Timeframe), BoundedRing<Bar>>,
}

impl Default for BarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BarBuilder {
    pub fn new() -> Self {
        Self {
            m1_partial: HashMap::new(),
            higher_partial: HashMap::new(),
            history: HashMap::new(),
        }
    }

    fn history_for(&mut self, symbol: &str, timeframe: Timeframe) -> &mut BoundedRing<Bar> {
        self.history
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| BoundedRing::new(BUFFER_CAPACITY))
    }

    /// Feeds one tick for `symbol`. Returns every bar (across all
    /// timeframes) that was finalized as a result — zero, one (just M1), or
    /// several if multiple higher-timeframe boundaries closed at once.
    pub fn on_tick(&mut self, symbol: &str, tick: Tick) -> Result<Vec<Bar>, BarValidationError> {
        let minute_ts = floor_to_minute(tick.timestamp);
        let mut finalized = Vec::new();

        let existing = self.m1_partial.get(symbol).map(|p| p.timestamp);
        match existing {
            Some(ts) if ts == minute_ts => {
                self.m1_partial.get_mut(symbol).unwrap().apply(&tick);
            }
            Some(ts) if ts < minute_ts => {
                let finished = self.m1_partial.remove(symbol).unwrap();
                let bar = finished.finalize(symbol)?;
                self.history_for(symbol, Timeframe::M1).push(bar.clone());
                finalized.push(bar.clone());
                finalized.extend(self.roll_up(symbol, &bar)?);
                self.m1_partial.insert(symbol.to_string(), PartialBar::new(minute_ts, &tick));
            }
            _ => {
                self.m1_partial.insert(symbol.to_string(), PartialBar::new(minute_ts, &tick));
            }
        }

        Ok(finalized)
    }

    fn roll_up(&mut self, symbol: &str, m1_bar: &Bar) -> Result<Vec<Bar>, BarValidationError> {
        let mut finalized = Vec::new();
        for tf in Timeframe::derived_from_m1() {
            let bucket = floor_to_timeframe(m1_bar.timestamp, tf);
            let key = (symbol.to_string(), tf);
            let entry = self.higher_partial.entry(key.clone()).or_insert(HigherTfAccumulator { partial: None });

            match &mut entry.partial {
                Some(partial) if partial.timestamp == bucket => {
                    partial.high = partial.high.max(m1_bar.high);
                    partial.low = partial.low.min(m1_bar.low);
                    partial.close = m1_bar.close;
                    partial.volume += m1_bar.volume;
                }
                Some(partial) if partial.timestamp < bucket => {
                    let finished = partial.finalize(symbol)?;
                    self.history_for(symbol, tf).push(finished.clone());
                    finalized.push(finished);
                    entry.partial = Some(PartialBar {
                        timestamp: bucket,
                        open: m1_bar.open,
                        high: m1_bar.high,
                        low: m1_bar.low,
                        close: m1_bar.close,
                        volume: m1_bar.volume,
                    });
                }
                _ => {
                    entry.partial = Some(PartialBar {
                        timestamp: bucket,
                        open: m1_bar.open,
                        high: m1_bar.high,
                        low: m1_bar.low,
                        close: m1_bar.close,
                        volume: m1_bar.volume,
                    });
                }
            }
        }
        Ok(finalized)
    }

    /// Force-closes every in-progress partial bar for `symbol` (e.g. on
    /// stream disconnect or shutdown) without waiting for the next tick to
    /// reveal the boundary crossed.
    pub fn force_finalize(&mut self, symbol: &str) -> Result<Vec<Bar>, BarValidationError> {
        let mut finalized = Vec::new();
        if let Some(partial) = self.m1_partial.remove(symbol) {
            let bar = partial.finalize(symbol)?;
            self.history_for(symbol, Timeframe::M1).push(bar.clone());
            finalized.push(bar.clone());
            finalized.extend(self.roll_up(symbol, &bar)?);
        }
        for tf in Timeframe::derived_from_m1() {
            let key = (symbol.to_string(), tf);
            if let Some(entry) = self.higher_partial.get_mut(&key) {
                if let Some(partial) = entry.partial.take() {
                    let bar = partial.finalize(symbol)?;
                    self.history_for(symbol, tf).push(bar.clone());
                    finalized.push(bar);
                }
            }
        }
        Ok(finalized)
    }

    pub fn history(&self, symbol: &str, timeframe: Timeframe) -> Vec<Bar> {
        self.history
            .get(&(symbol.to_string(), timeframe))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn tick(ts: &str, price: f64) -> Tick {
        Tick {
            timestamp: t(ts),
            price,
            volume: 1.0,
        }
    }

    #[test]
    fn ticks_within_same_minute_accumulate_into_one_bar() {
        let mut builder = BarBuilder::new();
        assert!(builder.on_tick("EURUSD", tick("2024-01-01T00:00:10Z", 1.10)).unwrap().is_empty());
        assert!(builder.on_tick("EURUSD", tick("2024-01-01T00:00:40Z", 1.12)).unwrap().is_empty());
        let finalized = builder.on_tick("EURUSD", tick("2024-01-01T00:01:05Z", 1.11)).unwrap();
        assert_eq!(finalized[0].open, 1.10);
        assert_eq!(finalized[0].high, 1.12);
        assert_eq!(finalized[0].close, 1.12);
    }

    #[test]
    fn force_finalize_closes_partial_bar_without_waiting() {
        let mut builder = BarBuilder::new();
        builder.on_tick("EURUSD", tick("2024-01-01T00:00:10Z", 1.10)).unwrap();
        let finalized = builder.force_finalize("EURUSD").unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].timeframe, Timeframe::M1);
    }

    #[test]
    fn history_is_bounded_to_buffer_capacity() {
        let mut builder = BarBuilder::new();
        let mut minute = t("2024-01-01T00:00:00Z");
        for _ in 0..(BUFFER_CAPACITY + 50) {
            builder
                .on_tick(
                    "EURUSD",
                    Tick {
                        timestamp: minute,
                        price: 1.1,
                        volume: 1.0,
                    },
                )
                .unwrap();
            minute += Duration::minutes(1);
        }
        assert!(builder.history("EURUSD", Timeframe::M1).len() <= BUFFER_CAPACITY);
    }

    #[test]
    fn five_minute_bar_rolls_up_from_five_one_minute_bars() {
        let mut builder = BarBuilder::new();
        let mut minute = t("2024-01-01T00:00:00Z");
        let mut last_finalized = Vec::new();
        for i in 0..6 {
            last_finalized = builder
                .on_tick(
                    "EURUSD",
                    Tick {
                        timestamp: minute,
                        price: 1.10 + i as f64 * 0.001,
                        volume: 1.0,
                    },
                )
                .unwrap();
            minute += Duration::minutes(1);
        }
        assert!(last_finalized.iter().any(|b| b.timeframe == Timeframe::M5));
    }
}
