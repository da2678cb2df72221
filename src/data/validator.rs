use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::Candle;
use crate::utils::WarnDedup;

use super::PriceError;

/// Collects every rule violated by the candle; empty means valid.
pub fn candle_issues(candle: &Candle) -> Vec<String> {
    let mut issues = Vec::new();
    if candle.open <= Decimal::ZERO {
        issues.push(format!("open price must be positive, got {}", candle.open));
    }
    if candle.high <= Decimal::ZERO {
        issues.push(format!("high price must be positive, got {}", candle.high));
    }
    if candle.low <= Decimal::ZERO {
        issues.push(format!("low price must be positive, got {}", candle.low));
    }
    if candle.close <= Decimal::ZERO {
        issues.push(format!("close price must be positive, got {}", candle.close));
    }
    if candle.high < candle.low {
        issues.push(format!("high ({}) must be >= low ({})", candle.high, candle.low));
    }
    if candle.high < candle.open {
        issues.push(format!("high ({}) must be >= open ({})", candle.high, candle.open));
    }
    if candle.high < candle.close {
        issues.push(format!("high ({}) must be >= close ({})", candle.high, candle.close));
    }
    if candle.low > candle.open {
        issues.push(format!("low ({}) must be <= open ({})", candle.low, candle.open));
    }
    if candle.low > candle.close {
        issues.push(format!("low ({}) must be <= close ({})", candle.low, candle.close));
    }
    if candle.volume < Decimal::ZERO {
        issues.push(format!("volume must be non-negative, got {}", candle.volume));
    }
    issues
}

/// Candle quality gate. In strict mode a malformed row aborts the load;
/// otherwise the row is dropped with a deduplicated warning.
#[derive(Debug, Clone)]
pub struct CandleValidator {
    strict: bool,
    warn: Arc<WarnDedup>,
}

impl CandleValidator {
    pub fn new(strict: bool, warn: Arc<WarnDedup>) -> Self {
        Self { strict, warn }
    }

    /// Returns Ok(true) when the candle passes, Ok(false) when it was
    /// rejected in lenient mode, Err in strict mode.
    pub fn validate(&self, contract: &str, candle: &Candle) -> Result<bool, PriceError> {
        let issues = candle_issues(candle);
        if issues.is_empty() {
            return Ok(true);
        }
        let detail = issues.join("; ");
        if self.strict {
            return Err(PriceError::InvalidCandle {
                timestamp: candle.timestamp.to_rfc3339(),
                detail,
            });
        }
        self.warn.warn_once(
            &format!("invalid_candle|{}", contract),
            &format!("invalid candle for {} at {}: {}", contract, candle.timestamp, detail),
        );
        Ok(false)
    }
}

/// Inter-candle jump gate: |open_t - close_{t-1}| / close_{t-1} must not
/// exceed `max_jump_pct` (decimal form). Returns the index of the first
/// offending candle. Used by the RR entry-quality check, not by Runner.
pub fn first_jump_violation(candles: &[Candle], max_jump_pct: f64) -> Option<usize> {
    for i in 1..candles.len() {
        let prev_close = candles[i - 1].close;
        if prev_close <= Decimal::ZERO {
            continue;
        }
        let jump = ((candles[i].open - prev_close) / prev_close)
            .abs()
            .to_f64()
            .unwrap_or(0.0);
        if jump > max_jump_pct {
            return Some(i);
        }
    }
    None
}
