use std::collections::HashMap;
use std::sync::Once;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

static RUNNER_RESET_DEPRECATION: Once = Once::new();
static RUNNER_RESET_CONFLICT: Once = Once::new();

/// Top-level application settings, loaded from TOML with env overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub portfolio: PortfolioSettings,
    #[serde(default)]
    pub backtest: BacktestWindow,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub strategies: Vec<StrategySpec>,
}

impl AppConfig {
    /// Loads from a TOML file (optional) layered under `BACKTESTER__*` env vars.
    pub fn load(path: &str) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BACKTESTER").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?;
        let cfg: AppConfig = raw
            .try_deserialize()
            .context("invalid configuration structure")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.portfolio.initial_balance_sol <= Decimal::ZERO {
            errors.push("portfolio.initial_balance_sol must be positive".to_string());
        }
        if self.portfolio.percent_per_trade <= Decimal::ZERO
            || self.portfolio.percent_per_trade > Decimal::ONE
        {
            errors.push("portfolio.percent_per_trade must be in (0, 1]".to_string());
        }
        if self.portfolio.max_exposure <= Decimal::ZERO {
            errors.push("portfolio.max_exposure must be positive".to_string());
        }
        if self.portfolio.max_open_positions == 0 {
            errors.push("portfolio.max_open_positions must be at least 1".to_string());
        }
        if self.rate_limit.max_calls == 0 {
            errors.push("rate_limit.max_calls must be at least 1".to_string());
        }
        for spec in &self.strategies {
            if let Err(e) = spec.validate() {
                errors.push(format!("strategy '{}': {}", spec.name, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration errors: {}", errors.join("; "))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSettings {
    /// Candle source: "gecko" (HTTP + cache) or "csv" (cache-only).
    pub loader: String,
    pub candles_dir: String,
    pub timeframe: String,
    /// Minutes of candles loaded before the signal timestamp.
    pub before_minutes: i64,
    /// Minutes of candles loaded after the signal timestamp.
    pub after_minutes: i64,
    pub prefer_cache_if_exists: bool,
    pub max_cache_age_days: i64,
    pub strict_validation: bool,
    /// Inter-candle jump gate, decimal form; None disables the check.
    pub max_price_jump_pct: Option<f64>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            loader: "gecko".to_string(),
            candles_dir: "data/candles/cached".to_string(),
            timeframe: "1m".to_string(),
            before_minutes: 60,
            after_minutes: 360,
            prefer_cache_if_exists: true,
            max_cache_age_days: 2,
            strict_validation: false,
            max_price_jump_pct: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum On429 {
    Wait,
    Fail,
}

impl On429 {
    pub fn as_str(&self) -> &'static str {
        match self {
            On429::Wait => "wait",
            On429::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_calls: usize,
    pub period_seconds: u64,
    pub on_429: On429,
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_calls: 30,
            period_seconds: 60,
            on_429: On429::Wait,
            max_retries: 3,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    Fixed,
    Dynamic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioSettings {
    pub initial_balance_sol: Decimal,
    pub allocation_mode: AllocationMode,
    pub percent_per_trade: Decimal,
    pub max_exposure: Decimal,
    pub max_open_positions: usize,
    #[serde(default)]
    pub fee: FeeSettings,
    pub execution_profile: String,
    pub profit_reset_enabled: Option<bool>,
    pub profit_reset_multiple: Option<Decimal>,
    /// Deprecated aliases for profit_reset_*; newer keys win.
    pub runner_reset_enabled: Option<bool>,
    pub runner_reset_multiple: Option<Decimal>,
    #[serde(default)]
    pub capacity_reset: CapacityResetSettings,
    pub use_replay_mode: bool,
    pub max_hold_minutes: Option<i64>,
    pub reset_grace_minutes: i64,
}

impl Default for PortfolioSettings {
    fn default() -> Self {
        Self {
            initial_balance_sol: dec!(10.0),
            allocation_mode: AllocationMode::Dynamic,
            percent_per_trade: dec!(0.1),
            max_exposure: dec!(0.5),
            max_open_positions: 10,
            fee: FeeSettings::default(),
            execution_profile: "realistic".to_string(),
            profit_reset_enabled: None,
            profit_reset_multiple: None,
            runner_reset_enabled: None,
            runner_reset_multiple: None,
            capacity_reset: CapacityResetSettings::default(),
            use_replay_mode: false,
            max_hold_minutes: None,
            reset_grace_minutes: 0,
        }
    }
}

impl PortfolioSettings {
    /// Resolves the profit-reset switch, honoring the deprecated
    /// `runner_reset_*` aliases. Newer keys win; the deprecation warning is
    /// emitted at most once per process.
    pub fn resolved_profit_reset(&self) -> (bool, Decimal) {
        let legacy_present =
            self.runner_reset_enabled.is_some() || self.runner_reset_multiple.is_some();
        let new_present =
            self.profit_reset_enabled.is_some() || self.profit_reset_multiple.is_some();

        if legacy_present && !new_present {
            RUNNER_RESET_DEPRECATION.call_once(|| {
                warn!(
                    "runner_reset_enabled/runner_reset_multiple are deprecated; \
                     rename them to profit_reset_enabled/profit_reset_multiple"
                );
            });
        } else if legacy_present && new_present {
            RUNNER_RESET_CONFLICT.call_once(|| {
                warn!(
                    "both profit_reset_* and runner_reset_* are configured; \
                     using profit_reset_* (runner_reset_* ignored)"
                );
            });
        }

        let enabled = self
            .profit_reset_enabled
            .or(self.runner_reset_enabled)
            .unwrap_or(false);
        let multiple = self
            .profit_reset_multiple
            .or(self.runner_reset_multiple)
            .unwrap_or(dec!(2.0));
        (enabled, multiple)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeSettings {
    pub swap_fee_pct: Decimal,
    pub lp_fee_pct: Decimal,
    /// Legacy single slippage; used when no profiles are configured.
    pub slippage_pct: Option<Decimal>,
    pub network_fee_sol: Decimal,
    pub profiles: Option<HashMap<String, ExecutionProfileSettings>>,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            swap_fee_pct: dec!(0.003),
            lp_fee_pct: dec!(0.001),
            slippage_pct: None,
            network_fee_sol: dec!(0.0005),
            profiles: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionProfileSettings {
    pub base_slippage_pct: Decimal,
    #[serde(default)]
    pub slippage_multipliers: SlippageMultipliers,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlippageMultipliers {
    pub entry: Decimal,
    pub exit_tp: Decimal,
    pub exit_sl: Decimal,
    pub exit_timeout: Decimal,
    pub exit_manual: Decimal,
}

impl Default for SlippageMultipliers {
    fn default() -> Self {
        Self {
            entry: Decimal::ONE,
            exit_tp: Decimal::ONE,
            exit_sl: Decimal::ONE,
            exit_timeout: Decimal::ONE,
            exit_manual: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityWindowType {
    Time,
    Signals,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityResetSettings {
    pub enabled: bool,
    pub window_type: CapacityWindowType,
    /// Days (time window) or signal count (signals window).
    pub window_size: u32,
    pub max_blocked_ratio: f64,
    pub max_avg_hold_days: f64,
}

impl Default for CapacityResetSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            window_type: CapacityWindowType::Time,
            window_size: 7,
            max_blocked_ratio: 0.4,
            max_avg_hold_days: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BacktestWindow {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSettings {
    pub output_dir: String,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: "output/reports".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    pub parallel: bool,
    pub max_workers: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: 4,
        }
    }
}

/// Declarative strategy definition from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    /// Strategy kind; only "runner" is built in.
    pub kind: String,
    #[serde(default)]
    pub take_profit_levels: Vec<TakeProfitLevelSpec>,
    pub time_stop_minutes: Option<i64>,
    #[serde(default = "default_true")]
    pub use_high_for_targets: bool,
    #[serde(default)]
    pub exit_on_first_tp: bool,
    #[serde(default = "default_true")]
    pub allow_partial_fills: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TakeProfitLevelSpec {
    pub xn: Decimal,
    pub fraction: Decimal,
}

impl StrategySpec {
    pub fn validate(&self) -> Result<()> {
        if self.kind != "runner" {
            anyhow::bail!("unknown strategy kind '{}'", self.kind);
        }
        if self.take_profit_levels.is_empty() {
            anyhow::bail!("take_profit_levels must not be empty");
        }
        for level in &self.take_profit_levels {
            if level.xn <= Decimal::ZERO {
                anyhow::bail!("take-profit xn must be positive, got {}", level.xn);
            }
            if level.fraction <= Decimal::ZERO || level.fraction > Decimal::ONE {
                anyhow::bail!("take-profit fraction must be in (0, 1], got {}", level.fraction);
            }
        }
        let total: Decimal = self.take_profit_levels.iter().map(|l| l.fraction).sum();
        if total > Decimal::ONE + dec!(0.000000001) {
            anyhow::bail!("take-profit fractions sum to {} (> 1.0)", total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rate_limit.max_calls, 30);
        assert_eq!(cfg.rate_limit.period_seconds, 60);
        assert_eq!(cfg.portfolio.execution_profile, "realistic");
    }

    #[test]
    fn test_deprecated_runner_reset_keys_are_honored() {
        let mut portfolio = PortfolioSettings::default();
        portfolio.runner_reset_enabled = Some(true);
        portfolio.runner_reset_multiple = Some(dec!(3.0));
        let (enabled, multiple) = portfolio.resolved_profit_reset();
        assert!(enabled);
        assert_eq!(multiple, dec!(3.0));
    }

    #[test]
    fn test_newer_profit_reset_keys_win_over_deprecated() {
        let mut portfolio = PortfolioSettings::default();
        portfolio.runner_reset_enabled = Some(true);
        portfolio.runner_reset_multiple = Some(dec!(3.0));
        portfolio.profit_reset_enabled = Some(false);
        portfolio.profit_reset_multiple = Some(dec!(1.5));
        let (enabled, multiple) = portfolio.resolved_profit_reset();
        assert!(!enabled);
        assert_eq!(multiple, dec!(1.5));
    }

    #[test]
    fn test_strategy_spec_rejects_oversubscribed_ladder() {
        let spec = StrategySpec {
            name: "runner_bad".to_string(),
            kind: "runner".to_string(),
            take_profit_levels: vec![
                TakeProfitLevelSpec { xn: dec!(2), fraction: dec!(0.7) },
                TakeProfitLevelSpec { xn: dec!(5), fraction: dec!(0.5) },
            ],
            time_stop_minutes: None,
            use_high_for_targets: true,
            exit_on_first_tp: false,
            allow_partial_fills: true,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_strategy_spec_accepts_full_ladder() {
        let spec = StrategySpec {
            name: "runner_ok".to_string(),
            kind: "runner".to_string(),
            take_profit_levels: vec![
                TakeProfitLevelSpec { xn: dec!(3), fraction: dec!(0.2) },
                TakeProfitLevelSpec { xn: dec!(7), fraction: dec!(0.3) },
                TakeProfitLevelSpec { xn: dec!(15), fraction: dec!(0.5) },
            ],
            time_stop_minutes: Some(4320),
            use_high_for_targets: true,
            exit_on_first_tp: false,
            allow_partial_fills: true,
        };
        assert!(spec.validate().is_ok());
    }
}
