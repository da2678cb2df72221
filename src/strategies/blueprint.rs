use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One planned partial exit: at `timestamp`, close `fraction` of the initial
/// size at the `xn` target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialExitPlan {
    pub timestamp: DateTime<Utc>,
    pub xn: Decimal,
    pub fraction: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalExitPlan {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Side-effect-free record of a strategy's decided entry, partial exits and
/// final exit. No portfolio, no money — replayable by any engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBlueprint {
    pub signal_id: String,
    pub strategy: String,
    pub contract_address: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price_raw: Decimal,
    pub entry_mcap_proxy: Option<Decimal>,
    pub partial_exits: Vec<PartialExitPlan>,
    /// Present iff the last ladder level was hit.
    pub final_exit: Option<FinalExitPlan>,
    pub realized_multiple: Decimal,
    pub max_xn_reached: Decimal,
    pub reason: String,
}

impl TradeBlueprint {
    pub fn no_entry(
        signal_id: &str,
        strategy: &str,
        contract_address: &str,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            strategy: strategy.to_string(),
            contract_address: contract_address.to_string(),
            entry_time,
            entry_price_raw: Decimal::ZERO,
            entry_mcap_proxy: None,
            partial_exits: Vec::new(),
            final_exit: None,
            realized_multiple: Decimal::ONE,
            max_xn_reached: Decimal::ZERO,
            reason: "no_entry".to_string(),
        }
    }
}
