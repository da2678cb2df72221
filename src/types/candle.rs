#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One closed OHLCV bar at minute (or k-minute) granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Sorts candles ascending by timestamp and drops duplicate timestamps,
/// first-seen wins. Every candle sequence handed to a strategy goes through
/// this guard.
pub fn sort_and_dedup(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.timestamp);
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match out.last() {
            Some(last) if last.timestamp == candle.timestamp => continue,
            _ => out.push(candle),
        }
    }
    out
}

/// Slice of a sorted candle sequence intersecting `[start, end]`, both ends
/// inclusive and optional.
pub fn slice_range(
    candles: &[Candle],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<Candle> {
    candles
        .iter()
        .filter(|c| start.map_or(true, |s| c.timestamp >= s))
        .filter(|c| end.map_or(true, |e| c.timestamp <= e))
        .cloned()
        .collect()
}
