use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed portfolio event kinds, append-only and time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioEventType {
    PositionOpened,
    PositionPartialExit,
    PositionClosed,
    PortfolioResetTriggered,
    RiskLimitHit,
}

impl PortfolioEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioEventType::PositionOpened => "POSITION_OPENED",
            PortfolioEventType::PositionPartialExit => "POSITION_PARTIAL_EXIT",
            PortfolioEventType::PositionClosed => "POSITION_CLOSED",
            PortfolioEventType::PortfolioResetTriggered => "PORTFOLIO_RESET_TRIGGERED",
            PortfolioEventType::RiskLimitHit => "RISK_LIMIT_HIT",
        }
    }
}

/// One entry of the portfolio event ledger.
///
/// `position_id` is set for all position events; a reset trigger references
/// the position that caused it (absent for capacity-driven resets, where no
/// single position is responsible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioEvent {
    pub event_type: PortfolioEventType,
    pub timestamp: DateTime<Utc>,
    pub position_id: Option<String>,
    pub signal_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl PortfolioEvent {
    pub fn new(
        event_type: PortfolioEventType,
        timestamp: DateTime<Utc>,
        position_id: Option<&str>,
        signal_id: Option<&str>,
        reason: &str,
    ) -> Self {
        Self {
            event_type,
            timestamp,
            position_id: position_id.map(str::to_string),
            signal_id: signal_id.map(str::to_string),
            reason: reason.to_string(),
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}
