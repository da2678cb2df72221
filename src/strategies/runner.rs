use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::types::{
    CanonicalReason, Candle, LadderOutcome, StrategyInput, StrategyOutput,
};

use super::blueprint::{FinalExitPlan, PartialExitPlan, TradeBlueprint};
use super::features::{mcap_features, window_features};
use super::ladder::{self, LadderExitReason, RunnerConfig};
use super::Strategy;

/// Runner strategy: enter on the first candle at/after the signal, manage the
/// position with a tiered take-profit ladder and an optional time-stop.
pub struct RunnerStrategy {
    config: RunnerConfig,
}

impl RunnerStrategy {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Candles at/after the signal, ascending.
    fn candles_after_signal<'a>(&self, input: &StrategyInput<'a>) -> Vec<Candle> {
        let mut candles: Vec<Candle> = input
            .candles
            .iter()
            .filter(|c| c.timestamp >= input.signal.timestamp)
            .cloned()
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        candles
    }
}

impl Strategy for RunnerStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn on_signal(&self, input: &StrategyInput<'_>) -> StrategyOutput {
        let candles = self.candles_after_signal(input);
        if candles.is_empty() {
            return StrategyOutput::no_entry("no candles after signal");
        }

        let entry_candle = candles[0].clone();
        let entry_time = entry_candle.timestamp;
        let entry_price = entry_candle.close;

        let result = ladder::simulate(entry_time, entry_price, &candles, &self.config);
        if result.reason == LadderExitReason::NoData {
            return StrategyOutput::no_entry("no candles after entry");
        }

        // Exit price is the market close of the candle at/after the final
        // exit time, never the synthetic entry * realized_multiple.
        let exit_price = candles
            .iter()
            .find(|c| c.timestamp >= result.exit_time)
            .map(|c| c.close)
            .or_else(|| candles.last().map(|c| c.close))
            .unwrap_or(entry_price);

        let (legacy_reason, ladder_reason) = match result.reason {
            LadderExitReason::AllLevelsHit => ("tp", CanonicalReason::LadderTp),
            LadderExitReason::TimeStop => ("timeout", CanonicalReason::TimeStop),
            LadderExitReason::NoData => ("no_entry", CanonicalReason::NoEntry),
        };
        debug!(
            "{}: entry {} @ {}, exit {} @ {} ({})",
            self.config.name, entry_time, entry_price, result.exit_time, exit_price, legacy_reason
        );

        let mut meta = window_features(input.candles, entry_time, entry_price);
        meta.extend(mcap_features(
            Some(entry_price),
            Some(exit_price),
            input.signal.total_supply(),
        ));
        meta.insert("runner_ladder".to_string(), serde_json::json!(true));
        meta.insert("entry_idx".to_string(), serde_json::json!(0));

        StrategyOutput {
            entry_time: Some(result.entry_time),
            entry_price: Some(result.entry_price),
            exit_time: Some(result.exit_time),
            exit_price: Some(exit_price),
            pnl: result.realized_pnl_pct / dec!(100),
            reason: legacy_reason.to_string(),
            ladder: Some(LadderOutcome {
                levels_hit: result.levels_hit.clone(),
                fractions_exited: result
                    .fractions_exited
                    .iter()
                    .map(|(xn, _, fraction)| (*xn, *fraction))
                    .collect(),
                realized_multiple: result.realized_multiple,
                time_stop_triggered: result.reason == LadderExitReason::TimeStop,
                ladder_reason,
            }),
            meta,
        }
    }

    /// Intent-only path: which levels would have been hit and when, without
    /// synthesizing PnL or touching a portfolio.
    fn blueprint(&self, input: &StrategyInput<'_>) -> TradeBlueprint {
        let candles = self.candles_after_signal(input);
        if candles.is_empty() {
            return TradeBlueprint::no_entry(
                &input.signal.id,
                &self.config.name,
                &input.signal.contract_address,
                input.signal.timestamp,
            );
        }

        let entry_candle = &candles[0];
        let entry_time = entry_candle.timestamp;
        let entry_price = entry_candle.close;
        let sorted_levels = self.config.sorted_levels();

        let mut partial_exits: Vec<PartialExitPlan> = Vec::new();
        let mut max_xn_reached = Decimal::ONE;

        for candle in &candles {
            let trigger = if self.config.use_high_for_targets {
                candle.high
            } else {
                candle.close
            };
            for level in &sorted_levels {
                if partial_exits.iter().any(|p| p.xn == level.xn) {
                    continue;
                }
                if trigger >= entry_price * level.xn {
                    partial_exits.push(PartialExitPlan {
                        timestamp: candle.timestamp,
                        xn: level.xn,
                        fraction: level.fraction,
                    });
                    max_xn_reached = max_xn_reached.max(level.xn);
                }
            }
        }
        partial_exits.sort_by_key(|p| p.timestamp);

        // Final exit exists iff the top rung was reached.
        let mut final_exit = None;
        let mut reason = "no_entry".to_string();
        if let Some(last_level) = sorted_levels.last() {
            if let Some(hit) = partial_exits.iter().find(|p| p.xn == last_level.xn) {
                final_exit = Some(FinalExitPlan {
                    timestamp: hit.timestamp,
                    reason: "all_levels_hit".to_string(),
                });
                reason = "all_levels_hit".to_string();
            }
        }

        let realized_multiple = if partial_exits.is_empty() {
            Decimal::ONE
        } else {
            partial_exits.iter().map(|p| p.fraction * p.xn).sum()
        };

        TradeBlueprint {
            signal_id: input.signal.id.clone(),
            strategy: self.config.name.clone(),
            contract_address: input.signal.contract_address.clone(),
            entry_time,
            entry_price_raw: entry_price,
            entry_mcap_proxy: Some(entry_price * input.signal.total_supply()),
            partial_exits,
            final_exit,
            realized_multiple,
            max_xn_reached,
            reason,
        }
    }
}
