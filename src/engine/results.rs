use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{PortfolioEvent, Position};

/// One point of the balance curve: before the simulation, then after every
/// balance-affecting event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    Entry,
    PartialExit,
    FinalExit,
    ResetClose,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Entry => "entry",
            ExecutionKind::PartialExit => "partial_exit",
            ExecutionKind::FinalExit => "final_exit",
            ExecutionKind::ResetClose => "reset_close",
        }
    }
}

/// One row of the executions ledger: entry, each partial exit, final exit or
/// reset close. For any position, Σ fees_sol over its rows equals the
/// position's fees_total_sol, and Σ pnl_sol_delta equals its pnl_sol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub position_id: String,
    pub signal_id: String,
    pub strategy: String,
    pub event_time: DateTime<Utc>,
    pub event_type: ExecutionKind,
    /// Signed size delta in SOL: positive at entry, negative on exits.
    pub qty_delta: Decimal,
    pub raw_price: Decimal,
    pub exec_price: Decimal,
    pub fees_sol: Decimal,
    pub pnl_sol_delta: Decimal,
    pub reset_reason: Option<String>,
}

/// Snapshot captured after a portfolio simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub final_balance_sol: Decimal,
    pub total_return_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub trades_executed: u64,
    pub trades_skipped_by_risk: u64,
    pub trades_skipped_by_reset: u64,
    pub portfolio_reset_count: u64,
    pub last_portfolio_reset_time: Option<DateTime<Utc>>,
    pub cycle_start_equity: Decimal,
    pub equity_peak_in_cycle: Decimal,
}

impl PortfolioStats {
    /// Backwards-compat alias for `portfolio_reset_count`.
    pub fn reset_count(&self) -> u64 {
        self.portfolio_reset_count
    }

    /// Backwards-compat alias for `last_portfolio_reset_time`.
    pub fn last_reset_time(&self) -> Option<DateTime<Utc>> {
        self.last_portfolio_reset_time
    }
}

/// Everything one portfolio simulation produced for one strategy.
#[derive(Debug, Clone)]
pub struct PortfolioResult {
    pub strategy: String,
    pub positions: Vec<Position>,
    pub events: Vec<PortfolioEvent>,
    pub executions: Vec<ExecutionRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub stats: PortfolioStats,
}

/// Max drawdown over a balance curve: the most negative
/// (balance - running_max) / running_max, always <= 0.
pub fn max_drawdown_pct(curve: &[EquityPoint]) -> Decimal {
    let mut running_max = Decimal::ZERO;
    let mut worst = Decimal::ZERO;
    for point in curve {
        if point.balance > running_max {
            running_max = point.balance;
        }
        if running_max > Decimal::ZERO {
            let dd = (point.balance - running_max) / running_max;
            if dd < worst {
                worst = dd;
            }
        }
    }
    worst
}
