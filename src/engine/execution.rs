use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{ExecutionProfileSettings, FeeSettings};

/// Leg kinds for the slippage profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegKind {
    Entry,
    ExitTp,
    ExitSl,
    ExitTimeout,
    ExitManual,
}

/// Executed exit leg: effective prices, the notional that came back, and the
/// fees charged on it.
#[derive(Debug, Clone, Copy)]
pub struct ExitFill {
    pub exec_entry_price: Decimal,
    pub exec_exit_price: Decimal,
    /// (exec_exit - exec_entry) / exec_entry, decimal form.
    pub effective_pnl_pct: Decimal,
    /// Notional before swap/LP fees.
    pub notional_returned: Decimal,
    /// What lands on the balance: after swap/LP fees, minus the network fee.
    pub credited_sol: Decimal,
    /// Swap/LP fee amount plus the exit network fee.
    pub fees_sol: Decimal,
    /// credited_sol - leg_size.
    pub pnl_sol_delta: Decimal,
}

/// Converts raw prices into executed prices and fees per leg.
///
/// Slippage is applied to prices (long: entry up, exit down); swap/LP fees to
/// the notional returned at exit; the flat network fee at entry and again at
/// every exit leg. Fees never change the PnL rate, only the returned
/// notional.
#[derive(Debug, Clone)]
pub struct ExecutionModel {
    fees: FeeSettings,
    profile: Option<ExecutionProfileSettings>,
}

impl ExecutionModel {
    /// `profile_name` selects from `fees.profiles`; without profiles the
    /// legacy flat `slippage_pct` applies to every leg.
    pub fn new(fees: FeeSettings, profile_name: &str) -> Self {
        let profile = fees
            .profiles
            .as_ref()
            .and_then(|profiles| profiles.get(profile_name).cloned());
        Self { fees, profile }
    }

    pub fn network_fee(&self) -> Decimal {
        self.fees.network_fee_sol
    }

    pub fn slippage_for(&self, leg: LegKind) -> Decimal {
        match &self.profile {
            Some(profile) => {
                let mult = match leg {
                    LegKind::Entry => profile.slippage_multipliers.entry,
                    LegKind::ExitTp => profile.slippage_multipliers.exit_tp,
                    LegKind::ExitSl => profile.slippage_multipliers.exit_sl,
                    LegKind::ExitTimeout => profile.slippage_multipliers.exit_timeout,
                    LegKind::ExitManual => profile.slippage_multipliers.exit_manual,
                };
                profile.base_slippage_pct * mult
            }
            None => self.fees.slippage_pct.unwrap_or(Decimal::ZERO),
        }
    }

    pub fn effective_entry_price(&self, raw_entry: Decimal) -> Decimal {
        raw_entry * (Decimal::ONE + self.slippage_for(LegKind::Entry))
    }

    /// Executes one exit leg of `leg_size` SOL opened at `raw_entry`.
    pub fn exit_leg(
        &self,
        leg_size: Decimal,
        raw_entry: Decimal,
        raw_exit: Decimal,
        kind: LegKind,
    ) -> ExitFill {
        let exec_entry = self.effective_entry_price(raw_entry);
        let exec_exit = raw_exit * (Decimal::ONE - self.slippage_for(kind));
        let effective_pnl_pct = if exec_entry > Decimal::ZERO {
            (exec_exit - exec_entry) / exec_entry
        } else {
            Decimal::ZERO
        };
        let notional_returned = leg_size * (Decimal::ONE + effective_pnl_pct);
        let after_fees =
            notional_returned * (Decimal::ONE - self.fees.swap_fee_pct - self.fees.lp_fee_pct);
        let network_fee = self.fees.network_fee_sol;
        let credited = after_fees - network_fee;
        ExitFill {
            exec_entry_price: exec_entry,
            exec_exit_price: exec_exit,
            effective_pnl_pct,
            notional_returned,
            credited_sol: credited,
            fees_sol: (notional_returned - after_fees) + network_fee,
            pnl_sol_delta: credited - leg_size,
        }
    }
}
