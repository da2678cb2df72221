use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Default total supply assumed when a signal does not carry one.
pub const DEFAULT_TOTAL_SUPPLY: Decimal = dec!(1_000_000_000);

/// One trading signal: a token contract plus the moment it was called.
/// Immutable after load; free-form columns from the signal CSV land in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub contract_address: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub narrative: String,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Signal {
    pub fn new(id: &str, contract_address: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            contract_address: contract_address.to_string(),
            timestamp,
            source: "unknown".to_string(),
            narrative: String::new(),
            extra: HashMap::new(),
        }
    }

    /// Token total supply from `extra.total_supply`, numeric or numeric-string.
    /// Falls back to 1e9 when absent or unparsable.
    pub fn total_supply(&self) -> Decimal {
        match self.extra.get("total_supply") {
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .and_then(Decimal::from_f64)
                .unwrap_or(DEFAULT_TOTAL_SUPPLY),
            Some(serde_json::Value::String(s)) => {
                s.trim().parse::<Decimal>().unwrap_or(DEFAULT_TOTAL_SUPPLY)
            }
            _ => DEFAULT_TOTAL_SUPPLY,
        }
    }
}
