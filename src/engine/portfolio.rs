use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::config::{
    AllocationMode, BacktestWindow, CapacityResetSettings, CapacityWindowType, FeeSettings,
    PortfolioSettings,
};
use crate::strategies::FRACTION_EPS;
use crate::types::{
    CanonicalReason, PortfolioEvent, PortfolioEventType, Position, PositionStatus, SignalResult,
};

use super::execution::{ExecutionModel, LegKind};
use super::results::{
    max_drawdown_pct, EquityPoint, ExecutionKind, ExecutionRecord, PortfolioResult, PortfolioStats,
};

/// Capacity-ratio triggers need a minimal sample to be meaningful.
const CAPACITY_MIN_ATTEMPTS: usize = 5;

/// Portfolio engine configuration, resolved from settings.
#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub initial_balance_sol: Decimal,
    pub allocation_mode: AllocationMode,
    pub percent_per_trade: Decimal,
    pub max_exposure: Decimal,
    pub max_open_positions: usize,
    pub fees: FeeSettings,
    pub execution_profile: String,
    pub backtest_start: Option<DateTime<Utc>>,
    pub backtest_end: Option<DateTime<Utc>>,
    pub profit_reset_enabled: bool,
    pub profit_reset_multiple: Decimal,
    pub runner_reset_enabled: bool,
    pub runner_reset_multiple: Decimal,
    pub capacity_reset: CapacityResetSettings,
    pub use_replay_mode: bool,
    pub max_hold_minutes: Option<i64>,
    pub reset_grace_minutes: i64,
}

impl PortfolioConfig {
    pub fn from_settings(portfolio: &PortfolioSettings, backtest: &BacktestWindow) -> Self {
        let (profit_enabled, profit_multiple) = portfolio.resolved_profit_reset();
        Self {
            initial_balance_sol: portfolio.initial_balance_sol,
            allocation_mode: portfolio.allocation_mode,
            percent_per_trade: portfolio.percent_per_trade,
            max_exposure: portfolio.max_exposure,
            max_open_positions: portfolio.max_open_positions,
            fees: portfolio.fee.clone(),
            execution_profile: portfolio.execution_profile.clone(),
            backtest_start: backtest.start_at,
            backtest_end: backtest.end_at,
            profit_reset_enabled: profit_enabled,
            profit_reset_multiple: profit_multiple,
            runner_reset_enabled: portfolio.runner_reset_enabled.unwrap_or(false),
            runner_reset_multiple: portfolio.runner_reset_multiple.unwrap_or(dec!(2.0)),
            capacity_reset: portfolio.capacity_reset.clone(),
            use_replay_mode: portfolio.use_replay_mode,
            max_hold_minutes: portfolio.max_hold_minutes,
            reset_grace_minutes: portfolio.reset_grace_minutes,
        }
    }

    pub fn basic(initial_balance_sol: Decimal, percent_per_trade: Decimal) -> Self {
        Self {
            initial_balance_sol,
            allocation_mode: AllocationMode::Dynamic,
            percent_per_trade,
            max_exposure: dec!(0.5),
            max_open_positions: 10,
            fees: FeeSettings::default(),
            execution_profile: "realistic".to_string(),
            backtest_start: None,
            backtest_end: None,
            profit_reset_enabled: false,
            profit_reset_multiple: dec!(2.0),
            runner_reset_enabled: false,
            runner_reset_multiple: dec!(2.0),
            capacity_reset: CapacityResetSettings::default(),
            use_replay_mode: false,
            max_hold_minutes: None,
            reset_grace_minutes: 0,
        }
    }
}

/// Event kinds ranked for same-timestamp ordering: close < open < partial.
#[derive(Debug)]
enum ReplayAction {
    Open(usize),
    Partial {
        position_id: String,
        xn: Decimal,
        fraction: Decimal,
    },
    Close {
        position_id: String,
        raw_exit_price: Decimal,
        leg: LegKind,
        reason: CanonicalReason,
    },
}

#[derive(Debug)]
struct QueuedEvent {
    time: DateTime<Utc>,
    rank: u8,
    seq: u64,
    action: ReplayAction,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.rank == other.rank && self.seq == other.seq
    }
}
impl Eq for QueuedEvent {}
impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.rank.cmp(&other.rank))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct AdmissionAttempt {
    time: DateTime<Utc>,
    blocked: bool,
}

struct SimState {
    balance: Decimal,
    open: HashMap<String, Position>,
    /// Exit legs per open position: (multiple, pnl_sol_delta).
    legs: HashMap<String, Vec<(Decimal, Decimal)>>,
    /// Realized multiple the strategy reported, per open position.
    realized_multiple: HashMap<String, Decimal>,
    closed: Vec<Position>,
    events: Vec<PortfolioEvent>,
    executions: Vec<ExecutionRecord>,
    equity_curve: Vec<EquityPoint>,
    queue: BinaryHeap<Reverse<QueuedEvent>>,
    seq: u64,
    trades_executed: u64,
    trades_skipped_by_risk: u64,
    trades_skipped_by_reset: u64,
    reset_count: u64,
    last_reset_time: Option<DateTime<Utc>>,
    cycle_start_equity: Decimal,
    equity_peak_in_cycle: Decimal,
    attempts: VecDeque<AdmissionAttempt>,
}

impl SimState {
    fn push_event(&mut self, time: DateTime<Utc>, rank: u8, action: ReplayAction) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(QueuedEvent {
            time,
            rank,
            seq,
            action,
        }));
    }

    fn mark_balance(&mut self, time: DateTime<Utc>) {
        self.equity_curve.push(EquityPoint {
            timestamp: time,
            balance: self.balance,
        });
        if self.balance > self.equity_peak_in_cycle {
            self.equity_peak_in_cycle = self.balance;
        }
    }
}

/// Single-threaded, deterministic portfolio replay over strategy outputs.
///
/// Records are sorted by (timestamp, signal_id); effects are applied at event
/// times with same-timestamp ordering close < open < partial, then event
/// sequence.
pub struct PortfolioEngine {
    config: PortfolioConfig,
    execution: ExecutionModel,
}

impl PortfolioEngine {
    pub fn new(config: PortfolioConfig) -> Self {
        let execution = ExecutionModel::new(config.fees.clone(), &config.execution_profile);
        Self { config, execution }
    }

    pub fn simulate(&self, results: &[SignalResult], strategy_name: &str) -> PortfolioResult {
        let mut trades: Vec<&SignalResult> = results
            .iter()
            .filter(|r| r.strategy == strategy_name)
            .filter(|r| r.output.entry_time.is_some() && r.output.entry_price.is_some())
            .filter(|r| {
                self.config.backtest_start.map_or(true, |s| r.timestamp >= s)
                    && self.config.backtest_end.map_or(true, |e| r.timestamp <= e)
            })
            .collect();
        trades.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.signal_id.cmp(&b.signal_id))
        });
        if self.config.use_replay_mode {
            debug!(
                "replay mode: {} recorded trades for {}",
                trades.len(),
                strategy_name
            );
        }

        let mut state = SimState {
            balance: self.config.initial_balance_sol,
            open: HashMap::new(),
            legs: HashMap::new(),
            realized_multiple: HashMap::new(),
            closed: Vec::new(),
            events: Vec::new(),
            executions: Vec::new(),
            equity_curve: Vec::new(),
            queue: BinaryHeap::new(),
            seq: 0,
            trades_executed: 0,
            trades_skipped_by_risk: 0,
            trades_skipped_by_reset: 0,
            reset_count: 0,
            last_reset_time: None,
            cycle_start_equity: self.config.initial_balance_sol,
            equity_peak_in_cycle: self.config.initial_balance_sol,
            attempts: VecDeque::new(),
        };

        if let Some(first) = trades.first() {
            state.equity_curve.push(EquityPoint {
                timestamp: first.output.entry_time.expect("filtered on entry_time"),
                balance: state.balance,
            });
        }
        for (idx, trade) in trades.iter().enumerate() {
            let entry_time = trade.output.entry_time.expect("filtered on entry_time");
            state.push_event(entry_time, 1, ReplayAction::Open(idx));
        }

        let mut last_event_time = trades
            .first()
            .and_then(|t| t.output.entry_time)
            .unwrap_or_else(Utc::now);

        while let Some(Reverse(event)) = state.queue.pop() {
            last_event_time = event.time;
            match event.action {
                ReplayAction::Open(idx) => {
                    self.handle_open(&mut state, trades[idx], event.time);
                }
                ReplayAction::Partial {
                    position_id,
                    xn,
                    fraction,
                } => {
                    self.handle_partial(&mut state, &position_id, event.time, xn, fraction);
                }
                ReplayAction::Close {
                    position_id,
                    raw_exit_price,
                    leg,
                    reason,
                } => {
                    self.handle_close(&mut state, &position_id, event.time, raw_exit_price, leg, reason);
                }
            }
        }

        // Anything still open had no scheduled exit: close flat.
        let leftovers: Vec<String> = state.open.keys().cloned().collect();
        for position_id in leftovers {
            let raw_entry = state.open[&position_id].raw_entry_price;
            self.close_position(
                &mut state,
                &position_id,
                last_event_time,
                raw_entry,
                LegKind::ExitManual,
                CanonicalReason::ManualClose.as_str(),
                ExecutionKind::FinalExit,
                false,
            );
        }

        let stats = PortfolioStats {
            final_balance_sol: state.balance,
            total_return_pct: if self.config.initial_balance_sol > Decimal::ZERO {
                (state.balance - self.config.initial_balance_sol) / self.config.initial_balance_sol
            } else {
                Decimal::ZERO
            },
            max_drawdown_pct: max_drawdown_pct(&state.equity_curve),
            trades_executed: state.trades_executed,
            trades_skipped_by_risk: state.trades_skipped_by_risk,
            trades_skipped_by_reset: state.trades_skipped_by_reset,
            portfolio_reset_count: state.reset_count,
            last_portfolio_reset_time: state.last_reset_time,
            cycle_start_equity: state.cycle_start_equity,
            equity_peak_in_cycle: state.equity_peak_in_cycle,
        };
        info!(
            "portfolio[{}]: balance {:.4} SOL, {} trades, {} risk-skips, {} resets",
            strategy_name,
            stats.final_balance_sol,
            stats.trades_executed,
            stats.trades_skipped_by_risk,
            stats.portfolio_reset_count
        );

        PortfolioResult {
            strategy: strategy_name.to_string(),
            positions: state.closed,
            events: state.events,
            executions: state.executions,
            equity_curve: state.equity_curve,
            stats,
        }
    }

    fn handle_open(&self, state: &mut SimState, trade: &SignalResult, time: DateTime<Utc>) {
        // Reset blackout: nothing is admitted at the reset instant or within
        // the grace window after it.
        if let Some(reset_time) = state.last_reset_time {
            let grace_end = reset_time + Duration::minutes(self.config.reset_grace_minutes);
            if time <= grace_end {
                state.trades_skipped_by_reset += 1;
                debug!(
                    "skipping {} at {}: inside reset grace window",
                    trade.signal_id, time
                );
                return;
            }
        }

        let raw_entry = trade.output.entry_price.expect("filtered on entry_price");
        let mut size = match self.config.allocation_mode {
            AllocationMode::Dynamic => state.balance * self.config.percent_per_trade,
            AllocationMode::Fixed => self.config.initial_balance_sol * self.config.percent_per_trade,
        };

        let network_fee = self.execution.network_fee();
        let exposure: Decimal = state.open.values().map(Position::open_notional).sum();
        let refusal = if state.open.len() >= self.config.max_open_positions {
            Some(format!(
                "max_open_positions {} reached",
                self.config.max_open_positions
            ))
        } else if exposure + size > self.config.max_exposure * state.balance {
            Some(format!(
                "exposure {} + size {} exceeds cap {}",
                exposure,
                size,
                self.config.max_exposure * state.balance
            ))
        } else if state.balance < network_fee {
            Some("balance insufficient for network fee".to_string())
        } else {
            if size + network_fee > state.balance {
                size = state.balance - network_fee;
            }
            if size <= Decimal::ZERO {
                Some("balance insufficient for any allocation".to_string())
            } else {
                None
            }
        };

        if let Some(reason) = refusal {
            state.trades_skipped_by_risk += 1;
            state.events.push(
                PortfolioEvent::new(
                    PortfolioEventType::RiskLimitHit,
                    time,
                    None,
                    Some(&trade.signal_id),
                    &reason,
                )
                .with_meta("strategy", serde_json::json!(trade.strategy)),
            );
            self.record_capacity_attempt(state, time, true);
            return;
        }
        self.record_capacity_attempt(state, time, false);

        let exec_entry = self.execution.effective_entry_price(raw_entry);
        let mut position = Position::open(
            &trade.signal_id,
            &trade.contract_address,
            &trade.strategy,
            time,
            raw_entry,
            exec_entry,
            size,
        );
        position.fees_total_sol = network_fee;
        let position_id = position.position_id.clone();

        state.balance -= size + network_fee;
        state.trades_executed += 1;
        state.executions.push(ExecutionRecord {
            position_id: position_id.clone(),
            signal_id: trade.signal_id.clone(),
            strategy: trade.strategy.clone(),
            event_time: time,
            event_type: ExecutionKind::Entry,
            qty_delta: size,
            raw_price: raw_entry,
            exec_price: exec_entry,
            fees_sol: network_fee,
            pnl_sol_delta: -network_fee,
            reset_reason: None,
        });
        state.events.push(PortfolioEvent::new(
            PortfolioEventType::PositionOpened,
            time,
            Some(&position_id),
            Some(&trade.signal_id),
            "entry",
        ));
        state.mark_balance(time);

        let realized_multiple = trade
            .output
            .ladder
            .as_ref()
            .map(|l| l.realized_multiple)
            .or_else(|| {
                match (trade.output.entry_price, trade.output.exit_price) {
                    (Some(entry), Some(exit)) if entry > Decimal::ZERO => Some(exit / entry),
                    _ => None,
                }
            })
            .unwrap_or(Decimal::ONE);
        state
            .realized_multiple
            .insert(position_id.clone(), realized_multiple);
        state.legs.insert(position_id.clone(), Vec::new());
        state.open.insert(position_id.clone(), position);

        self.schedule_exits(state, trade, &position_id, time, raw_entry);
    }

    /// Plans partial exits and the final close for an admitted position,
    /// applying the optional max-hold cutoff.
    fn schedule_exits(
        &self,
        state: &mut SimState,
        trade: &SignalResult,
        position_id: &str,
        entry_time: DateTime<Utc>,
        raw_entry: Decimal,
    ) {
        let cutoff = self
            .config
            .max_hold_minutes
            .map(|m| entry_time + Duration::minutes(m));

        let mut last_partial_time: Option<DateTime<Utc>> = None;
        if let Some(ladder) = &trade.output.ladder {
            for (xn, fraction) in &ladder.fractions_exited {
                let hit_time = ladder.hit_time_for(*xn).unwrap_or(entry_time);
                if cutoff.map_or(true, |c| hit_time <= c) {
                    last_partial_time = last_partial_time.max(Some(hit_time));
                    state.push_event(
                        hit_time,
                        2,
                        ReplayAction::Partial {
                            position_id: position_id.to_string(),
                            xn: *xn,
                            fraction: *fraction,
                        },
                    );
                }
            }
        }
        // Close-before-open ordering holds across positions; within one
        // position the lifecycle order wins, so a close sharing its instant
        // with this position's own partial exits runs after them.
        let close_rank = |t: DateTime<Utc>| if last_partial_time == Some(t) { 3 } else { 0 };

        let exit_time = trade.output.exit_time;
        let raw_exit = trade.output.exit_price.unwrap_or(raw_entry);
        let reason = trade.output.canonical_reason();
        let leg = match reason {
            CanonicalReason::LadderTp => LegKind::ExitTp,
            CanonicalReason::StopLoss => LegKind::ExitSl,
            CanonicalReason::TimeStop | CanonicalReason::MaxHoldMinutes => LegKind::ExitTimeout,
            _ => LegKind::ExitManual,
        };

        match (exit_time, cutoff) {
            (Some(t), Some(c)) if t > c => {
                // Truncated by the hold cap: the remainder closes flat at the
                // cutoff, there is no price data beyond the strategy's legs.
                state.push_event(
                    c,
                    close_rank(c),
                    ReplayAction::Close {
                        position_id: position_id.to_string(),
                        raw_exit_price: raw_entry,
                        leg: LegKind::ExitTimeout,
                        reason: CanonicalReason::MaxHoldMinutes,
                    },
                );
            }
            (Some(t), _) => {
                state.push_event(
                    t,
                    close_rank(t),
                    ReplayAction::Close {
                        position_id: position_id.to_string(),
                        raw_exit_price: raw_exit,
                        leg,
                        reason,
                    },
                );
            }
            (None, _) => {
                // No exit recorded by the strategy: left to the end-of-run
                // flat close.
            }
        }
    }

    fn handle_partial(
        &self,
        state: &mut SimState,
        position_id: &str,
        time: DateTime<Utc>,
        xn: Decimal,
        fraction: Decimal,
    ) {
        let Some(position) = state.open.get_mut(position_id) else {
            return; // closed earlier (reset or truncation)
        };
        let fraction = fraction.min(position.remaining_fraction);
        if fraction <= FRACTION_EPS {
            return;
        }

        let leg_size = position.size * fraction;
        let raw_target = position.raw_entry_price * xn;
        let fill = self
            .execution
            .exit_leg(leg_size, position.raw_entry_price, raw_target, LegKind::ExitTp);

        position.remaining_fraction -= fraction;
        position.fees_total_sol += fill.fees_sol;
        if xn > position.max_xn_reached {
            position.max_xn_reached = xn;
        }
        let signal_id = position.signal_id.clone();
        let strategy = position.strategy.clone();

        state.balance += fill.credited_sol;
        state
            .legs
            .get_mut(position_id)
            .expect("legs tracked for every open position")
            .push((xn, fill.pnl_sol_delta));
        state.executions.push(ExecutionRecord {
            position_id: position_id.to_string(),
            signal_id: signal_id.clone(),
            strategy,
            event_time: time,
            event_type: ExecutionKind::PartialExit,
            qty_delta: -leg_size,
            raw_price: raw_target,
            exec_price: fill.exec_exit_price,
            fees_sol: fill.fees_sol,
            pnl_sol_delta: fill.pnl_sol_delta,
            reset_reason: None,
        });
        state.events.push(
            PortfolioEvent::new(
                PortfolioEventType::PositionPartialExit,
                time,
                Some(position_id),
                Some(&signal_id),
                "partial_exit",
            )
            .with_meta("level_xn", serde_json::json!(xn.to_f64()))
            .with_meta("fraction", serde_json::json!(fraction.to_f64())),
        );
        state.mark_balance(time);
        self.check_profit_reset(state, time, Some(position_id));
    }

    fn handle_close(
        &self,
        state: &mut SimState,
        position_id: &str,
        time: DateTime<Utc>,
        raw_exit_price: Decimal,
        leg: LegKind,
        reason: CanonicalReason,
    ) {
        if !state.open.contains_key(position_id) {
            return;
        }
        let realized_multiple = state
            .realized_multiple
            .get(position_id)
            .copied()
            .unwrap_or(Decimal::ONE);
        self.close_position(
            state,
            position_id,
            time,
            raw_exit_price,
            leg,
            reason.as_str(),
            ExecutionKind::FinalExit,
            false,
        );

        if self.config.runner_reset_enabled
            && realized_multiple >= self.config.runner_reset_multiple
        {
            self.trigger_reset(state, time, "profit_reset", Some(position_id));
            return;
        }
        self.check_profit_reset(state, time, Some(position_id));
    }

    /// `trigger` is the position whose balance effect may have pushed the
    /// cycle equity over the threshold.
    fn check_profit_reset(&self, state: &mut SimState, time: DateTime<Utc>, trigger: Option<&str>) {
        if !self.config.profit_reset_enabled || state.cycle_start_equity <= Decimal::ZERO {
            return;
        }
        if state.equity_peak_in_cycle / state.cycle_start_equity >= self.config.profit_reset_multiple
        {
            self.trigger_reset(state, time, "profit_reset", trigger);
        }
    }

    /// Closes the remaining fraction and stamps the position.
    #[allow(clippy::too_many_arguments)]
    fn close_position(
        &self,
        state: &mut SimState,
        position_id: &str,
        time: DateTime<Utc>,
        raw_exit_price: Decimal,
        leg: LegKind,
        reason: &str,
        exec_kind: ExecutionKind,
        by_reset: bool,
    ) {
        let Some(mut position) = state.open.remove(position_id) else {
            return;
        };
        let remaining = position.remaining_fraction;
        let exec_exit =
            raw_exit_price * (Decimal::ONE - self.execution.slippage_for(leg));

        if remaining > FRACTION_EPS {
            let leg_size = position.size * remaining;
            let fill =
                self.execution
                    .exit_leg(leg_size, position.raw_entry_price, raw_exit_price, leg);
            state.balance += fill.credited_sol;
            position.remaining_fraction = Decimal::ZERO;
            position.fees_total_sol += fill.fees_sol;
            let close_multiple = if position.raw_entry_price > Decimal::ZERO {
                raw_exit_price / position.raw_entry_price
            } else {
                Decimal::ONE
            };
            state
                .legs
                .get_mut(position_id)
                .expect("legs tracked for every open position")
                .push((close_multiple, fill.pnl_sol_delta));
            state.executions.push(ExecutionRecord {
                position_id: position_id.to_string(),
                signal_id: position.signal_id.clone(),
                strategy: position.strategy.clone(),
                event_time: time,
                event_type: exec_kind,
                qty_delta: -leg_size,
                raw_price: raw_exit_price,
                exec_price: fill.exec_exit_price,
                fees_sol: fill.fees_sol,
                pnl_sol_delta: fill.pnl_sol_delta,
                reset_reason: by_reset.then(|| reason.to_string()),
            });
        }

        let legs = state.legs.remove(position_id).unwrap_or_default();
        let realized_total: Decimal = legs.iter().map(|(_, pnl)| *pnl).sum();
        let realized_tail: Decimal = legs
            .iter()
            .filter(|(multiple, _)| *multiple >= crate::types::TAIL_XN_THRESHOLD)
            .map(|(_, pnl)| *pnl)
            .sum();
        let network_fee_entry = self.execution.network_fee();

        position.exit_time = Some(time);
        position.raw_exit_price = Some(raw_exit_price);
        position.exec_exit_price = Some(exec_exit);
        position.hold_minutes = (time - position.entry_time).num_minutes();
        position.status = PositionStatus::Closed;
        position.exit_reason = Some(reason.to_string());
        position.closed_by_reset = by_reset;
        position.reset_reason = by_reset.then(|| reason.to_string());
        position.realized_total_pnl_sol = realized_total;
        position.realized_tail_pnl_sol = realized_tail;
        position.pnl_sol = realized_total - network_fee_entry;
        if position.raw_entry_price > Decimal::ZERO {
            let close_multiple = raw_exit_price / position.raw_entry_price;
            if close_multiple > position.max_xn_reached {
                position.max_xn_reached = close_multiple;
            }
        }

        state.realized_multiple.remove(position_id);
        state.events.push(PortfolioEvent::new(
            PortfolioEventType::PositionClosed,
            time,
            Some(position_id),
            Some(&position.signal_id),
            reason,
        ));
        state.closed.push(position);
        state.mark_balance(time);
    }

    /// Closes every open position at the trigger instant, then starts a new
    /// cycle. New entries inside (reset_time, reset_time + grace] are refused.
    fn trigger_reset(
        &self,
        state: &mut SimState,
        time: DateTime<Utc>,
        reason: &str,
        trigger_position_id: Option<&str>,
    ) {
        state.reset_count += 1;
        state.last_reset_time = Some(time);
        state.events.push(PortfolioEvent::new(
            PortfolioEventType::PortfolioResetTriggered,
            time,
            trigger_position_id,
            None,
            reason,
        ));
        if let Some(trigger_id) = trigger_position_id {
            // A trigger still open (a partial exit tipped the cycle) closes
            // now, but keeps closed_by_reset=false: it caused the reset, it
            // was not swept by it.
            if state.open.contains_key(trigger_id) {
                let raw_entry = state.open[trigger_id].raw_entry_price;
                self.close_position(
                    state,
                    trigger_id,
                    time,
                    raw_entry,
                    LegKind::ExitManual,
                    reason,
                    ExecutionKind::ResetClose,
                    false,
                );
            }
            if let Some(p) = state
                .closed
                .iter_mut()
                .find(|p| p.position_id == trigger_id)
            {
                p.triggered_portfolio_reset = true;
                p.closed_by_reset = false;
            }
        }

        let mut open_ids: Vec<(DateTime<Utc>, String)> = state
            .open
            .values()
            .map(|p| (p.entry_time, p.position_id.clone()))
            .collect();
        open_ids.sort();
        for (_, position_id) in open_ids {
            // No mid-flight market price exists in the replay; the remainder
            // returns at entry price under the manual-exit slippage leg.
            let raw_entry = state.open[&position_id].raw_entry_price;
            self.close_position(
                state,
                &position_id,
                time,
                raw_entry,
                LegKind::ExitManual,
                reason,
                ExecutionKind::ResetClose,
                true,
            );
        }

        state.cycle_start_equity = state.balance;
        state.equity_peak_in_cycle = state.balance;
        state.attempts.clear();
        info!("portfolio reset #{} at {} ({})", state.reset_count, time, reason);
    }

    fn record_capacity_attempt(&self, state: &mut SimState, time: DateTime<Utc>, blocked: bool) {
        if !self.config.capacity_reset.enabled {
            return;
        }
        state.attempts.push_back(AdmissionAttempt { time, blocked });
        match self.config.capacity_reset.window_type {
            CapacityWindowType::Time => {
                let horizon =
                    time - Duration::days(i64::from(self.config.capacity_reset.window_size));
                while state.attempts.front().map_or(false, |a| a.time < horizon) {
                    state.attempts.pop_front();
                }
            }
            CapacityWindowType::Signals => {
                let cap = self.config.capacity_reset.window_size as usize;
                while state.attempts.len() > cap {
                    state.attempts.pop_front();
                }
            }
        }
        // Only a blocked attempt can tip the window over its thresholds.
        if !blocked {
            return;
        }

        let total = state.attempts.len();
        let blocked_count = state.attempts.iter().filter(|a| a.blocked).count();
        let blocked_ratio = blocked_count as f64 / total as f64;
        let ratio_breached = total >= CAPACITY_MIN_ATTEMPTS
            && blocked_ratio > self.config.capacity_reset.max_blocked_ratio;

        let avg_hold_days = if state.open.is_empty() {
            0.0
        } else {
            let total_days: f64 = state
                .open
                .values()
                .map(|p| (time - p.entry_time).num_minutes() as f64 / 1440.0)
                .sum();
            total_days / state.open.len() as f64
        };
        let hold_breached =
            !state.open.is_empty() && avg_hold_days > self.config.capacity_reset.max_avg_hold_days;

        if ratio_breached || hold_breached {
            debug!(
                "capacity reset: blocked_ratio={:.2} avg_hold_days={:.2}",
                blocked_ratio, avg_hold_days
            );
            self.trigger_reset(state, time, "capacity_prune", None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LadderOutcome, StrategyOutput};
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn simple_output(
        entry_minute: i64,
        exit_minute: i64,
        entry_price: Decimal,
        exit_price: Decimal,
        reason: &str,
    ) -> StrategyOutput {
        StrategyOutput {
            entry_time: Some(at(entry_minute)),
            entry_price: Some(entry_price),
            exit_time: Some(at(exit_minute)),
            exit_price: Some(exit_price),
            pnl: (exit_price - entry_price) / entry_price,
            reason: reason.to_string(),
            ladder: None,
            meta: StdHashMap::new(),
        }
    }

    fn record(signal_id: &str, minute: i64, output: StrategyOutput) -> SignalResult {
        SignalResult {
            signal_id: signal_id.to_string(),
            contract_address: format!("TOKEN_{}", signal_id),
            strategy: "runner_test".to_string(),
            timestamp: at(minute),
            output,
        }
    }

    fn ladder_output(
        entry_minute: i64,
        entry_price: Decimal,
        levels: Vec<(Decimal, i64, Decimal)>,
        exit_minute: i64,
        exit_price: Decimal,
        time_stop: bool,
    ) -> StrategyOutput {
        let realized: Decimal = levels.iter().map(|(xn, _, f)| *xn * *f).sum();
        StrategyOutput {
            entry_time: Some(at(entry_minute)),
            entry_price: Some(entry_price),
            exit_time: Some(at(exit_minute)),
            exit_price: Some(exit_price),
            pnl: realized - Decimal::ONE,
            reason: if time_stop { "timeout" } else { "tp" }.to_string(),
            ladder: Some(LadderOutcome {
                levels_hit: levels.iter().map(|(xn, m, _)| (*xn, at(*m))).collect(),
                fractions_exited: levels.iter().map(|(xn, _, f)| (*xn, *f)).collect(),
                realized_multiple: realized,
                time_stop_triggered: time_stop,
                ladder_reason: if time_stop {
                    CanonicalReason::TimeStop
                } else {
                    CanonicalReason::LadderTp
                },
            }),
            meta: StdHashMap::new(),
        }
    }

    #[test]
    fn test_single_trade_applies_fees_and_slippage() {
        // Mirrors the raw +5% trade that turns into a loss after 10%
        // slippage on both prices.
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        config.fees.slippage_pct = Some(dec!(0.10));
        let engine = PortfolioEngine::new(config);

        let results = vec![record("s1", 0, simple_output(0, 120, dec!(1.0), dec!(1.05), "tp"))];
        let result = engine.simulate(&results, "runner_test");

        assert_eq!(result.stats.trades_executed, 1);
        assert_eq!(result.stats.trades_skipped_by_risk, 0);
        assert_eq!(result.positions.len(), 1);

        let size = dec!(1.0);
        let network_fee = dec!(0.0005);
        let effective_pnl = (dec!(0.945) - dec!(1.1)) / dec!(1.1);
        let notional_returned = size * (Decimal::ONE + effective_pnl);
        let after_fees = notional_returned * (Decimal::ONE - dec!(0.003) - dec!(0.001));
        let expected_final = dec!(10.0) - size - network_fee + after_fees - network_fee;
        assert!((result.stats.final_balance_sol - expected_final).abs() < dec!(0.0000001));

        // Equity curve: initial point, after open, after close.
        assert!(result.equity_curve.len() >= 3);
        assert_eq!(result.equity_curve[0].balance, dec!(10.0));
        assert_eq!(
            result.equity_curve.last().unwrap().balance,
            result.stats.final_balance_sol
        );
        let after_open = dec!(10.0) - size - network_fee;
        assert!(result
            .equity_curve
            .iter()
            .any(|p| (p.balance - after_open).abs() < dec!(0.0000001)));

        // Total return reflects fees, not the raw PnL.
        assert_ne!(result.stats.total_return_pct, dec!(0.05));
    }

    #[test]
    fn test_ladder_event_ledger() {
        // Levels 2x/5x/10x with fractions 0.4/0.4/0.2: 3 partial exits, one
        // close, everything carrying the same position_id.
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let output = ladder_output(
            0,
            dec!(100),
            vec![
                (dec!(2), 10, dec!(0.4)),
                (dec!(5), 20, dec!(0.4)),
                (dec!(10), 30, dec!(0.2)),
            ],
            30,
            dec!(800),
            false,
        );
        let results = vec![record("s1", 0, output)];
        let result = engine.simulate(&results, "runner_test");

        let opened: Vec<_> = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PositionOpened)
            .collect();
        let partials: Vec<_> = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PositionPartialExit)
            .collect();
        let closes: Vec<_> = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PositionClosed)
            .collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(partials.len(), 3);
        assert_eq!(closes.len(), 1);

        let position = &result.positions[0];
        for event in opened.iter().chain(partials.iter()).chain(closes.iter()) {
            assert_eq!(event.position_id.as_deref(), Some(position.position_id.as_str()));
        }

        // Fractions are against the initial size and sum to 1.
        // remaining after 0.4+0.4+0.2 is zero, so the final close adds no leg.
        let exit_rows: Vec<_> = result
            .executions
            .iter()
            .filter(|x| x.event_type == ExecutionKind::PartialExit)
            .collect();
        assert_eq!(exit_rows.len(), 3);
        let total_qty: Decimal = exit_rows.iter().map(|x| -x.qty_delta).sum();
        assert!((total_qty - dec!(1.0)).abs() < dec!(0.0000001));

        // Exit price stamped from the market close, not entry * 4.8.
        assert_eq!(position.raw_exit_price, Some(dec!(800)));
        assert_eq!(position.max_xn_reached, dec!(10));
    }

    #[test]
    fn test_fees_total_is_sum_of_executions() {
        // Ladder trade closing in two legs: entry fee + 2 exit fee rows.
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let output = ladder_output(
            0,
            dec!(100),
            vec![(dec!(3), 10, dec!(0.2))],
            120,
            dec!(10),
            true,
        );
        let results = vec![record("s1", 0, output)];
        let result = engine.simulate(&results, "runner_test");

        let position = &result.positions[0];
        let fee_sum: Decimal = result
            .executions
            .iter()
            .filter(|x| x.position_id == position.position_id)
            .map(|x| x.fees_sol)
            .sum();
        assert!((position.fees_total_sol - fee_sum).abs() < dec!(0.0000001));

        let pnl_sum: Decimal = result
            .executions
            .iter()
            .filter(|x| x.position_id == position.position_id)
            .map(|x| x.pnl_sol_delta)
            .sum();
        assert!((position.pnl_sol - pnl_sum).abs() < dec!(0.0000001));
    }

    #[test]
    fn test_time_stop_mid_ladder_event_counts() {
        // One hit level then a time-stop close: 1 partial exit, 1 close.
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let output = ladder_output(
            0,
            dec!(100),
            vec![(dec!(3), 10, dec!(0.2))],
            120,
            dec!(10),
            true,
        );
        let results = vec![record("s1", 0, output)];
        let result = engine.simulate(&results, "runner_test");

        let partials = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PositionPartialExit)
            .count();
        let closes = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PositionClosed)
            .count();
        assert_eq!(partials, 1);
        assert_eq!(closes, 1);
        assert_eq!(result.positions[0].exit_reason.as_deref(), Some("time_stop"));
    }

    #[test]
    fn test_profit_reset_closes_open_positions() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.5));
        config.max_exposure = dec!(2.0);
        config.profit_reset_enabled = true;
        config.profit_reset_multiple = dec!(1.1);
        let engine = PortfolioEngine::new(config);

        // s1 closes at +150% while s2 is still in flight.
        let results = vec![
            record("s1", 0, simple_output(0, 60, dec!(1.0), dec!(2.5), "tp")),
            record("s2", 5, simple_output(5, 240, dec!(1.0), dec!(2.5), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");

        assert!(result.stats.portfolio_reset_count >= 1);
        let reset_events = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::PortfolioResetTriggered)
            .count();
        assert!(reset_events >= 1);

        let triggering: Vec<_> = result
            .positions
            .iter()
            .filter(|p| p.triggered_portfolio_reset)
            .collect();
        let swept: Vec<_> = result
            .positions
            .iter()
            .filter(|p| p.closed_by_reset)
            .collect();
        assert_eq!(triggering.len(), 1);
        assert_eq!(triggering[0].signal_id, "s1");
        assert!(!triggering[0].closed_by_reset);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].signal_id, "s2");
        assert!(!swept[0].triggered_portfolio_reset);
        assert_eq!(swept[0].reset_reason.as_deref(), Some("profit_reset"));

        // s2's own scheduled close arrives later and must be a no-op.
        let closes_for_s2 = result
            .events
            .iter()
            .filter(|e| {
                e.event_type == PortfolioEventType::PositionClosed
                    && e.position_id.as_deref() == Some(swept[0].position_id.as_str())
            })
            .count();
        assert_eq!(closes_for_s2, 1);
    }

    #[test]
    fn test_entries_inside_grace_window_are_skipped() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.5));
        config.max_exposure = dec!(1.0);
        config.profit_reset_enabled = true;
        config.profit_reset_multiple = dec!(1.1);
        config.reset_grace_minutes = 30;
        let engine = PortfolioEngine::new(config);

        let results = vec![
            record("s1", 0, simple_output(0, 60, dec!(1.0), dec!(2.5), "tp")),
            // Entry exactly at the reset instant: refused.
            record("s2", 60, simple_output(60, 120, dec!(1.0), dec!(1.5), "tp")),
            // Entry inside the grace window: refused.
            record("s3", 80, simple_output(80, 140, dec!(1.0), dec!(1.5), "tp")),
            // Entry after the grace window: admitted.
            record("s4", 100, simple_output(100, 160, dec!(1.0), dec!(1.5), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");

        assert_eq!(result.stats.trades_skipped_by_reset, 2);
        let admitted: Vec<_> = result.positions.iter().map(|p| p.signal_id.as_str()).collect();
        assert!(admitted.contains(&"s4"));
        assert!(!admitted.contains(&"s2"));
        assert!(!admitted.contains(&"s3"));

        // Invariant: the first admitted entry after a reset is strictly later.
        let reset_time = result.stats.last_portfolio_reset_time.unwrap();
        for p in result.positions.iter().filter(|p| p.entry_time > at(0)) {
            assert!(p.entry_time > reset_time);
        }
    }

    #[test]
    fn test_admission_caps() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        config.max_open_positions = 1;
        let engine = PortfolioEngine::new(config);

        let results = vec![
            record("s1", 0, simple_output(0, 100, dec!(1.0), dec!(1.1), "tp")),
            record("s2", 5, simple_output(5, 100, dec!(1.0), dec!(1.1), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");

        assert_eq!(result.stats.trades_executed, 1);
        assert_eq!(result.stats.trades_skipped_by_risk, 1);
        let risk_events = result
            .events
            .iter()
            .filter(|e| e.event_type == PortfolioEventType::RiskLimitHit)
            .count();
        assert_eq!(risk_events, 1);
    }

    #[test]
    fn test_exposure_cap_blocks_admission() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.4));
        config.max_exposure = dec!(0.5);
        let engine = PortfolioEngine::new(config);

        let results = vec![
            record("s1", 0, simple_output(0, 100, dec!(1.0), dec!(1.1), "tp")),
            // 4 SOL open, next dynamic size 2.4; 4 + 2.4 > 0.5 * 6.
            record("s2", 5, simple_output(5, 100, dec!(1.0), dec!(1.1), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");
        assert_eq!(result.stats.trades_executed, 1);
        assert_eq!(result.stats.trades_skipped_by_risk, 1);
    }

    #[test]
    fn test_equity_curve_monotonic_and_drawdown_nonpositive() {
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let results = vec![
            record("s1", 0, simple_output(0, 60, dec!(1.0), dec!(0.5), "sl")),
            record("s2", 10, simple_output(10, 90, dec!(1.0), dec!(2.0), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");

        for pair in result.equity_curve.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert!(result.stats.max_drawdown_pct <= Decimal::ZERO);
    }

    #[test]
    fn test_max_hold_minutes_truncates_trade() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        config.max_hold_minutes = Some(30);
        let engine = PortfolioEngine::new(config);
        let results = vec![record("s1", 0, simple_output(0, 120, dec!(1.0), dec!(3.0), "tp"))];
        let result = engine.simulate(&results, "runner_test");

        let position = &result.positions[0];
        assert_eq!(position.exit_time, Some(at(30)));
        assert_eq!(position.hold_minutes, 30);
        assert_eq!(position.exit_reason.as_deref(), Some("max_hold_minutes"));
        // Flat close at entry price.
        assert_eq!(position.raw_exit_price, Some(dec!(1.0)));
    }

    #[test]
    fn test_tail_decomposition_from_legs() {
        // 2x leg is non-tail, 5x leg is tail; the remainder closes at 0.5x.
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let output = ladder_output(
            0,
            dec!(100),
            vec![(dec!(2), 10, dec!(0.4)), (dec!(5), 20, dec!(0.3))],
            60,
            dec!(50),
            true,
        );
        let results = vec![record("s1", 0, output)];
        let result = engine.simulate(&results, "runner_test");

        let position = &result.positions[0];
        let tail_rows: Decimal = result
            .executions
            .iter()
            .filter(|x| x.event_type == ExecutionKind::PartialExit && x.raw_price == dec!(500))
            .map(|x| x.pnl_sol_delta)
            .sum();
        assert!((position.realized_tail_pnl_sol - tail_rows).abs() < dec!(0.0000001));
        assert!(position.realized_total_pnl_sol > position.realized_tail_pnl_sol);
        // pnl_sol = realized legs minus the entry network fee.
        assert!(
            (position.pnl_sol - (position.realized_total_pnl_sol - dec!(0.0005))).abs()
                < dec!(0.0000001)
        );
    }

    #[test]
    fn test_runner_reset_marks_trigger_position() {
        let mut config = PortfolioConfig::basic(dec!(10.0), dec!(0.3));
        config.max_exposure = dec!(1.0);
        config.runner_reset_enabled = true;
        config.runner_reset_multiple = dec!(4.0);
        let engine = PortfolioEngine::new(config);

        let big = ladder_output(
            0,
            dec!(100),
            vec![(dec!(2), 10, dec!(0.4)), (dec!(10), 30, dec!(0.6))],
            30,
            dec!(900),
            false,
        );
        let results = vec![
            record("s1", 0, big),
            record("s2", 5, simple_output(5, 300, dec!(1.0), dec!(1.2), "tp")),
        ];
        let result = engine.simulate(&results, "runner_test");

        assert_eq!(result.stats.portfolio_reset_count, 1);
        let trigger = result
            .positions
            .iter()
            .find(|p| p.signal_id == "s1")
            .unwrap();
        assert!(trigger.triggered_portfolio_reset);
        assert!(!trigger.closed_by_reset);
        let swept = result
            .positions
            .iter()
            .find(|p| p.signal_id == "s2")
            .unwrap();
        assert!(swept.closed_by_reset);
    }

    #[test]
    fn test_strategy_filter_ignores_other_strategies() {
        let config = PortfolioConfig::basic(dec!(10.0), dec!(0.1));
        let engine = PortfolioEngine::new(config);
        let mut other = record("s1", 0, simple_output(0, 60, dec!(1.0), dec!(1.1), "tp"));
        other.strategy = "other_strategy".to_string();
        let result = engine.simulate(&[other], "runner_test");
        assert_eq!(result.stats.trades_executed, 0);
        assert!(result.positions.is_empty());
    }
}
