use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Fraction bookkeeping tolerance.
pub const FRACTION_EPS: Decimal = dec!(0.000000001);

/// One rung of a take-profit ladder: close `fraction` of the initial size
/// once price reaches `xn` times the entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub xn: Decimal,
    pub fraction: Decimal,
}

/// Runner strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    pub take_profit_levels: Vec<TakeProfitLevel>,
    pub time_stop_minutes: Option<i64>,
    pub use_high_for_targets: bool,
    pub exit_on_first_tp: bool,
    pub allow_partial_fills: bool,
}

impl RunnerConfig {
    pub fn new(name: &str, levels: Vec<TakeProfitLevel>) -> Self {
        Self {
            name: name.to_string(),
            take_profit_levels: levels,
            time_stop_minutes: None,
            use_high_for_targets: true,
            exit_on_first_tp: false,
            allow_partial_fills: true,
        }
    }

    /// Levels sorted by xn ascending; equal xn keeps declaration order.
    pub fn sorted_levels(&self) -> Vec<TakeProfitLevel> {
        let mut levels = self.take_profit_levels.clone();
        levels.sort_by(|a, b| a.xn.cmp(&b.xn));
        levels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderExitReason {
    TimeStop,
    AllLevelsHit,
    NoData,
}

/// Pure output of one ladder simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderTradeResult {
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_time: DateTime<Utc>,
    /// Cumulative value returned by the ladder, in units of initial size.
    pub realized_multiple: Decimal,
    pub realized_pnl_pct: Decimal,
    /// (xn, first hit time), in hit order.
    pub levels_hit: Vec<(Decimal, DateTime<Utc>)>,
    /// (xn, hit time, fraction exited), in hit order.
    pub fractions_exited: Vec<(Decimal, DateTime<Utc>, Decimal)>,
    pub reason: LadderExitReason,
}

impl LadderTradeResult {
    fn no_data(entry_time: DateTime<Utc>, entry_price: Decimal) -> Self {
        Self {
            entry_time,
            entry_price,
            exit_time: entry_time,
            realized_multiple: Decimal::ONE,
            realized_pnl_pct: Decimal::ZERO,
            levels_hit: Vec::new(),
            fractions_exited: Vec::new(),
            reason: LadderExitReason::NoData,
        }
    }
}

/// Simulates the tiered take-profit ladder over a post-entry candle stream.
///
/// The walk checks the time-stop first on every candle, then unhit levels in
/// ascending xn. A hit level is credited at the target price (entry * xn),
/// never at the candle close; only the tail close at stream exhaustion or
/// time-stop uses the market close.
pub fn simulate(
    entry_time: DateTime<Utc>,
    entry_price: Decimal,
    candles: &[Candle],
    config: &RunnerConfig,
) -> LadderTradeResult {
    let mut after_entry: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.timestamp >= entry_time)
        .collect();
    after_entry.sort_by_key(|c| c.timestamp);

    if after_entry.is_empty() || entry_price <= Decimal::ZERO {
        return LadderTradeResult::no_data(entry_time, entry_price);
    }

    let sorted_levels = config.sorted_levels();
    let time_stop = config
        .time_stop_minutes
        .map(|m| entry_time + Duration::minutes(m));

    let mut remaining = Decimal::ONE;
    let mut realized_value = Decimal::ZERO;
    let mut levels_hit: Vec<(Decimal, DateTime<Utc>)> = Vec::new();
    let mut fractions_exited: Vec<(Decimal, DateTime<Utc>, Decimal)> = Vec::new();

    for candle in &after_entry {
        // Time-stop first: close the remainder at this candle's close.
        if let Some(stop) = time_stop {
            if candle.timestamp >= stop {
                if remaining > Decimal::ZERO {
                    let exit_multiple = candle.close / entry_price;
                    realized_value += remaining * exit_multiple;
                    remaining = Decimal::ZERO;
                }
                return LadderTradeResult {
                    entry_time,
                    entry_price,
                    exit_time: candle.timestamp,
                    realized_multiple: realized_value,
                    realized_pnl_pct: (realized_value - Decimal::ONE) * dec!(100),
                    levels_hit,
                    fractions_exited,
                    reason: LadderExitReason::TimeStop,
                };
            }
        }

        let trigger_price = if config.use_high_for_targets {
            candle.high
        } else {
            candle.close
        };

        for level in &sorted_levels {
            if levels_hit.iter().any(|(xn, _)| *xn == level.xn) {
                continue;
            }
            let target_price = entry_price * level.xn;
            if trigger_price < target_price {
                continue;
            }
            levels_hit.push((level.xn, candle.timestamp));

            let fraction = if config.exit_on_first_tp {
                remaining
            } else {
                level.fraction.min(remaining)
            };
            if fraction <= Decimal::ZERO {
                continue;
            }
            // Credit the exited fraction at the target price, not the close.
            realized_value += fraction * level.xn;
            remaining -= fraction;
            fractions_exited.push((level.xn, candle.timestamp, fraction));

            if remaining <= FRACTION_EPS {
                return LadderTradeResult {
                    entry_time,
                    entry_price,
                    exit_time: candle.timestamp,
                    realized_multiple: realized_value,
                    realized_pnl_pct: (realized_value - Decimal::ONE) * dec!(100),
                    levels_hit,
                    fractions_exited,
                    reason: LadderExitReason::AllLevelsHit,
                };
            }
        }
    }

    // Stream exhausted with an open remainder: market close of the last candle.
    let last = after_entry.last().expect("non-empty after-entry stream");
    let exit_time = last.timestamp;
    if remaining > Decimal::ZERO {
        realized_value += remaining * (last.close / entry_price);
    }
    let reason = match time_stop {
        Some(stop) if exit_time >= stop => LadderExitReason::TimeStop,
        _ => LadderExitReason::AllLevelsHit,
    };

    LadderTradeResult {
        entry_time,
        entry_price,
        exit_time,
        realized_multiple: realized_value,
        realized_pnl_pct: (realized_value - Decimal::ONE) * dec!(100),
        levels_hit,
        fractions_exited,
        reason,
    }
}
