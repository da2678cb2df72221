pub mod blueprint;
pub mod features;
pub mod ladder;
pub mod runner;

pub use blueprint::*;
pub use features::*;
pub use ladder::*;
pub use runner::*;

use anyhow::Result;

use crate::config::StrategySpec;
use crate::types::{StrategyInput, StrategyOutput};

/// A per-signal strategy: consumes one signal with its candle window,
/// produces an outcome (and, optionally, a side-effect-free blueprint).
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn on_signal(&self, input: &StrategyInput<'_>) -> StrategyOutput;

    /// Intent-only record of the decided entry/exits. No PnL synthesis.
    fn blueprint(&self, input: &StrategyInput<'_>) -> TradeBlueprint;
}

/// Builds the configured strategies. Only the Runner kind is built in.
pub fn build_strategies(specs: &[StrategySpec]) -> Result<Vec<std::sync::Arc<dyn Strategy>>> {
    let mut strategies: Vec<std::sync::Arc<dyn Strategy>> = Vec::with_capacity(specs.len());
    for spec in specs {
        spec.validate()?;
        let mut config = RunnerConfig::new(
            &spec.name,
            spec.take_profit_levels
                .iter()
                .map(|l| TakeProfitLevel {
                    xn: l.xn,
                    fraction: l.fraction,
                })
                .collect(),
        );
        config.time_stop_minutes = spec.time_stop_minutes;
        config.use_high_for_targets = spec.use_high_for_targets;
        config.exit_on_first_tp = spec.exit_on_first_tp;
        config.allow_partial_fills = spec.allow_partial_fills;
        strategies.push(std::sync::Arc::new(RunnerStrategy::new(config)));
    }
    Ok(strategies)
}
