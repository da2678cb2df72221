use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Levels at or above this xn count as tail legs.
pub const TAIL_XN_THRESHOLD: Decimal = dec!(4.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// One portfolio position over its lifecycle: open → (partial exit)* → closed.
///
/// `position_id` is generated at open (uuid4, hyphenless) and never reused;
/// every execution row and event for this position references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub signal_id: String,
    pub contract_address: String,
    pub strategy: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    /// Size in quote currency (SOL) allocated at open.
    pub size: Decimal,
    pub raw_entry_price: Decimal,
    pub exec_entry_price: Decimal,
    pub raw_exit_price: Option<Decimal>,
    pub exec_exit_price: Option<Decimal>,
    pub pnl_sol: Decimal,
    pub fees_total_sol: Decimal,
    pub hold_minutes: i64,
    pub max_xn_reached: Decimal,
    pub status: PositionStatus,
    pub exit_reason: Option<String>,
    pub closed_by_reset: bool,
    pub triggered_portfolio_reset: bool,
    pub reset_reason: Option<String>,
    /// Realized PnL across all exit legs (entry network fee excluded).
    pub realized_total_pnl_sol: Decimal,
    /// Realized PnL of legs whose xn >= 4.0.
    pub realized_tail_pnl_sol: Decimal,
    /// Fraction of the initial size still open. Engine bookkeeping.
    #[serde(default)]
    pub remaining_fraction: Decimal,
}

impl Position {
    pub fn open(
        signal_id: &str,
        contract_address: &str,
        strategy: &str,
        entry_time: DateTime<Utc>,
        raw_entry_price: Decimal,
        exec_entry_price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4().simple().to_string(),
            signal_id: signal_id.to_string(),
            contract_address: contract_address.to_string(),
            strategy: strategy.to_string(),
            entry_time,
            exit_time: None,
            size,
            raw_entry_price,
            exec_entry_price,
            raw_exit_price: None,
            exec_exit_price: None,
            pnl_sol: Decimal::ZERO,
            fees_total_sol: Decimal::ZERO,
            hold_minutes: 0,
            max_xn_reached: Decimal::ONE,
            status: PositionStatus::Open,
            exit_reason: None,
            closed_by_reset: false,
            triggered_portfolio_reset: false,
            reset_reason: None,
            realized_total_pnl_sol: Decimal::ZERO,
            realized_tail_pnl_sol: Decimal::ZERO,
            remaining_fraction: Decimal::ONE,
        }
    }

    pub fn hit_x2(&self) -> bool {
        self.max_xn_reached >= dec!(2.0)
    }

    pub fn hit_x4(&self) -> bool {
        self.max_xn_reached >= dec!(4.0)
    }

    pub fn hit_x5(&self) -> bool {
        self.max_xn_reached >= dec!(5.0)
    }

    /// Remaining allocated notional, used for the exposure cap.
    pub fn open_notional(&self) -> Decimal {
        self.size * self.remaining_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn open_position() -> Position {
        Position::open(
            "sig1",
            "TOKEN1",
            "runner",
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            dec!(1.0),
            dec!(1.1),
            dec!(1.0),
        )
    }

    #[test]
    fn test_position_id_is_uuid4_simple_and_unique() {
        let p1 = open_position();
        let p2 = open_position();
        assert_eq!(p1.position_id.len(), 32);
        assert!(p1.position_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(p1.position_id, p2.position_id);
    }

    #[test]
    fn test_hit_flags_follow_max_xn() {
        let mut p = open_position();
        p.max_xn_reached = dec!(4.5);
        assert!(p.hit_x2());
        assert!(p.hit_x4());
        assert!(!p.hit_x5());
    }

    #[test]
    fn test_open_notional_tracks_remaining_fraction() {
        let mut p = open_position();
        assert_eq!(p.open_notional(), dec!(1.0));
        p.remaining_fraction = dec!(0.4);
        assert_eq!(p.open_notional(), dec!(0.4));
    }
}
