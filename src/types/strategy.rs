use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Candle, Signal};

/// Read-only view handed to a strategy for one signal.
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    pub signal: &'a Signal,
    pub candles: &'a [Candle],
}

/// Canonical exit reasons. Every legacy reason string maps into this closed
/// set; canonical values are fixed points of the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalReason {
    LadderTp,
    StopLoss,
    TimeStop,
    CapacityPrune,
    ProfitReset,
    ManualClose,
    NoEntry,
    Error,
    MaxHoldMinutes,
}

impl CanonicalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalReason::LadderTp => "ladder_tp",
            CanonicalReason::StopLoss => "stop_loss",
            CanonicalReason::TimeStop => "time_stop",
            CanonicalReason::CapacityPrune => "capacity_prune",
            CanonicalReason::ProfitReset => "profit_reset",
            CanonicalReason::ManualClose => "manual_close",
            CanonicalReason::NoEntry => "no_entry",
            CanonicalReason::Error => "error",
            CanonicalReason::MaxHoldMinutes => "max_hold_minutes",
        }
    }

    /// Parses an already-canonical reason string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ladder_tp" => Some(CanonicalReason::LadderTp),
            "stop_loss" => Some(CanonicalReason::StopLoss),
            "time_stop" => Some(CanonicalReason::TimeStop),
            "capacity_prune" => Some(CanonicalReason::CapacityPrune),
            "profit_reset" => Some(CanonicalReason::ProfitReset),
            "manual_close" => Some(CanonicalReason::ManualClose),
            "no_entry" => Some(CanonicalReason::NoEntry),
            "error" => Some(CanonicalReason::Error),
            "max_hold_minutes" => Some(CanonicalReason::MaxHoldMinutes),
            _ => None,
        }
    }
}

impl std::fmt::Display for CanonicalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ladder-specific outcome attached to a Runner StrategyOutput.
/// This is the typed form of the ladder meta bag: level hit times and exited
/// fractions keyed by xn, plus the canonical ladder reason which wins during
/// reason canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderOutcome {
    /// (xn, first hit time), ascending by xn.
    pub levels_hit: Vec<(Decimal, DateTime<Utc>)>,
    /// (xn, fraction of initial size exited at that level), ascending by xn.
    pub fractions_exited: Vec<(Decimal, Decimal)>,
    pub realized_multiple: Decimal,
    pub time_stop_triggered: bool,
    pub ladder_reason: CanonicalReason,
}

impl LadderOutcome {
    pub fn hit_time_for(&self, xn: Decimal) -> Option<DateTime<Utc>> {
        self.levels_hit
            .iter()
            .find(|(level, _)| *level == xn)
            .map(|(_, t)| *t)
    }
}

/// Per-signal outcome of a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    /// Net result in decimal form (0.05 = +5%).
    pub pnl: Decimal,
    /// Legacy free-form reason ("tp", "sl", "timeout", ...).
    pub reason: String,
    /// Typed ladder meta, present for Runner outputs.
    pub ladder: Option<LadderOutcome>,
    /// Loose diagnostic bag: pre-window features, mcap proxies, error detail.
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl StrategyOutput {
    pub fn no_entry(detail: &str) -> Self {
        let mut meta = HashMap::new();
        meta.insert("detail".to_string(), serde_json::json!(detail));
        Self {
            entry_time: None,
            entry_price: None,
            exit_time: None,
            exit_price: None,
            pnl: Decimal::ZERO,
            reason: "no_entry".to_string(),
            ladder: None,
            meta,
        }
    }

    pub fn error(detail: &str) -> Self {
        let mut meta = HashMap::new();
        meta.insert("exception".to_string(), serde_json::json!(detail));
        Self {
            entry_time: None,
            entry_price: None,
            exit_time: None,
            exit_price: None,
            pnl: Decimal::ZERO,
            reason: "error".to_string(),
            ladder: None,
            meta,
        }
    }

    /// Canonicalization rule: the ladder reason wins when present; else the
    /// legacy→canonical map {tp, sl, timeout}; canonical values pass through
    /// unchanged; anything else is an error.
    pub fn canonical_reason(&self) -> CanonicalReason {
        if let Some(ladder) = &self.ladder {
            return ladder.ladder_reason;
        }
        let normalized = self.reason.trim().to_lowercase();
        if let Some(canonical) = CanonicalReason::parse(&normalized) {
            return canonical;
        }
        match normalized.as_str() {
            "tp" => CanonicalReason::LadderTp,
            "sl" => CanonicalReason::StopLoss,
            "timeout" => CanonicalReason::TimeStop,
            _ => CanonicalReason::Error,
        }
    }
}

/// One strategy's output for one signal, tagged with its provenance.
/// This is the unit the portfolio engine replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResult {
    pub signal_id: String,
    pub contract_address: String,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub output: StrategyOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn output_with_reason(reason: &str) -> StrategyOutput {
        StrategyOutput {
            entry_time: None,
            entry_price: None,
            exit_time: None,
            exit_price: None,
            pnl: Decimal::ZERO,
            reason: reason.to_string(),
            ladder: None,
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_legacy_reasons_map_to_canonical() {
        assert_eq!(
            output_with_reason("tp").canonical_reason(),
            CanonicalReason::LadderTp
        );
        assert_eq!(
            output_with_reason("sl").canonical_reason(),
            CanonicalReason::StopLoss
        );
        assert_eq!(
            output_with_reason("timeout").canonical_reason(),
            CanonicalReason::TimeStop
        );
        assert_eq!(
            output_with_reason("no_entry").canonical_reason(),
            CanonicalReason::NoEntry
        );
    }

    #[test]
    fn test_canonical_reason_is_fixed_point() {
        for reason in [
            "ladder_tp",
            "stop_loss",
            "time_stop",
            "capacity_prune",
            "profit_reset",
            "manual_close",
            "no_entry",
            "error",
            "max_hold_minutes",
        ] {
            let canonical = output_with_reason(reason).canonical_reason();
            assert_eq!(canonical.as_str(), reason);
            // Canonicalizing the canonical form changes nothing.
            assert_eq!(
                output_with_reason(canonical.as_str()).canonical_reason(),
                canonical
            );
        }
    }

    #[test]
    fn test_unknown_reason_becomes_error() {
        assert_eq!(
            output_with_reason("something_else").canonical_reason(),
            CanonicalReason::Error
        );
    }

    #[test]
    fn test_ladder_reason_wins_over_legacy_string() {
        let mut output = output_with_reason("tp");
        output.ladder = Some(LadderOutcome {
            levels_hit: vec![],
            fractions_exited: vec![],
            realized_multiple: dec!(0.68),
            time_stop_triggered: true,
            ladder_reason: CanonicalReason::TimeStop,
        });
        assert_eq!(output.canonical_reason(), CanonicalReason::TimeStop);
    }
}
