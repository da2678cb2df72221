use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::windows::{median, split_into_equal_windows, window_metrics, PositionRow};
use super::StageError;

/// Default multi-scale split counts.
pub const DEFAULT_SPLITS: [usize; 3] = [3, 4, 5];

/// Legacy tail threshold (tail_contribution counts positions >= 5x).
const LEGACY_TAIL_XN: f64 = 5.0;
/// Realized-share tail threshold (tail legs are >= 4x).
const TAIL_XN: f64 = 4.0;

const EPS: f64 = 1e-6;

/// One row of the stability table: robustness metrics for a strategy at one
/// split count, plus Runner tail metrics when the strategy is a Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityRow {
    pub strategy: String,
    pub split_count: usize,
    pub survival_rate: f64,
    pub pnl_variance: f64,
    pub worst_window_pnl: f64,
    pub best_window_pnl: f64,
    pub median_window_pnl: f64,
    pub windows_positive: usize,
    pub windows_total: usize,
    pub trades_total: usize,
    pub hit_rate_x2: Option<f64>,
    pub hit_rate_x4: Option<f64>,
    pub hit_rate_x5: Option<f64>,
    pub p90_hold_days: Option<f64>,
    /// Legacy share: whole-position PnL of >= 5x positions over total PnL.
    pub tail_contribution: Option<f64>,
    /// Realized share of tail legs (>= 4x); fallback treats >= 4x positions
    /// as entirely tail, so the shares may leave [0, 1].
    pub tail_pnl_share: Option<f64>,
    pub non_tail_pnl_share: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
}

/// Runner vs RR/RRD typing by name: lowercase contains "runner", or the
/// legacy "rr_" prefix.
pub fn is_runner_strategy(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    !lowered.is_empty() && (lowered.contains("runner") || lowered.starts_with("rr_"))
}

/// Linear-interpolated percentile (the numpy default), q in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("no NaN in percentile input"));
    let rank = (sorted.len() - 1) as f64 * q / 100.0;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }
}

/// Sample variance; 0 when fewer than two observations.
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

#[derive(Debug, Clone, Default)]
struct RunnerMetrics {
    hit_rate_x2: f64,
    hit_rate_x4: f64,
    hit_rate_x5: f64,
    p90_hold_days: f64,
    tail_contribution: f64,
    tail_pnl_share: f64,
    non_tail_pnl_share: f64,
    max_drawdown_pct: f64,
}

/// Runner-specific metrics over a strategy's closed positions; the portfolio
/// positions table is the source of truth for hit rates.
fn runner_metrics(rows: &[PositionRow], max_drawdown_pct: Option<f64>) -> RunnerMetrics {
    let mut metrics = RunnerMetrics {
        max_drawdown_pct: max_drawdown_pct.unwrap_or(0.0),
        ..RunnerMetrics::default()
    };
    if rows.is_empty() {
        return metrics;
    }
    let total = rows.len() as f64;

    let hit = |row: &PositionRow, flag: Option<bool>, threshold: f64| -> bool {
        match flag {
            Some(v) => v,
            None => row.max_xn().map_or(false, |xn| xn >= threshold),
        }
    };
    metrics.hit_rate_x2 =
        rows.iter().filter(|r| hit(r, r.hit_x2, 2.0)).count() as f64 / total;
    metrics.hit_rate_x4 =
        rows.iter().filter(|r| hit(r, r.hit_x4, TAIL_XN)).count() as f64 / total;
    metrics.hit_rate_x5 =
        rows.iter().filter(|r| hit(r, r.hit_x5, 5.0)).count() as f64 / total;

    let hold_days: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.hold_minutes)
        .map(|m| m / 1440.0)
        .collect();
    metrics.p90_hold_days = percentile(&hold_days, 90.0);

    // Legacy tail contribution: whole-position PnL of >= 5x positions.
    let total_pnl: f64 = rows.iter().filter_map(|r| r.pnl_sol).sum();
    if total_pnl.abs() >= EPS {
        let tail_pnl: f64 = rows
            .iter()
            .filter(|r| r.max_xn().map_or(false, |xn| xn >= LEGACY_TAIL_XN))
            .filter_map(|r| r.pnl_sol)
            .sum();
        metrics.tail_contribution = tail_pnl / total_pnl;
    }

    // Realized shares from the leg decomposition; fallback treats a >= 4x
    // position's whole PnL as tail.
    let has_realized = rows
        .iter()
        .any(|r| r.realized_total_pnl_sol.is_some() && r.realized_tail_pnl_sol.is_some());
    let (realized_total, realized_tail) = if has_realized {
        (
            rows.iter().filter_map(|r| r.realized_total_pnl_sol).sum::<f64>(),
            rows.iter().filter_map(|r| r.realized_tail_pnl_sol).sum::<f64>(),
        )
    } else {
        let total: f64 = rows.iter().filter_map(|r| r.pnl_sol).sum();
        let tail: f64 = rows
            .iter()
            .filter(|r| r.max_xn().map_or(false, |xn| xn >= TAIL_XN))
            .filter_map(|r| r.pnl_sol)
            .sum();
        (total, tail)
    };
    if realized_total.abs() >= EPS {
        metrics.tail_pnl_share = realized_tail / realized_total;
        metrics.non_tail_pnl_share = (realized_total - realized_tail) / realized_total;
    }

    metrics
}

/// Builds the stability table: one row per (strategy, split_count), with
/// window PnLs including empty-window zeros. Rows are emitted in first-seen
/// strategy order and are never re-sorted or filtered.
pub fn build_stability_table(
    rows: &[PositionRow],
    split_counts: &[usize],
    summary_drawdowns: Option<&HashMap<String, f64>>,
) -> Vec<StabilityRow> {
    let closed: Vec<&PositionRow> = rows.iter().filter(|r| r.is_closed()).collect();

    let mut strategy_order: Vec<String> = Vec::new();
    for row in &closed {
        if !strategy_order.contains(&row.strategy) {
            strategy_order.push(row.strategy.clone());
        }
    }

    let mut table = Vec::new();
    for strategy in &strategy_order {
        let strategy_rows: Vec<PositionRow> = closed
            .iter()
            .filter(|r| &r.strategy == strategy)
            .map(|r| (*r).clone())
            .collect();
        let trades_total = strategy_rows.len();
        info!(
            "stability: strategy '{}' with {} executed trades",
            strategy, trades_total
        );

        let runner = if is_runner_strategy(strategy) {
            let dd = summary_drawdowns.and_then(|m| {
                m.get(strategy)
                    .copied()
                    .or_else(|| m.values().next().copied())
            });
            Some(runner_metrics(&strategy_rows, dd))
        } else {
            None
        };

        for &split_n in split_counts {
            let windows = split_into_equal_windows(&strategy_rows, split_n);
            let window_pnls: Vec<f64> = windows
                .iter()
                .map(|w| window_metrics(&strategy_rows, &w.rows).total_pnl)
                .collect();

            let windows_total = window_pnls.len();
            let windows_positive = window_pnls.iter().filter(|p| **p > 0.0).count();
            let survival_rate = if windows_total > 0 {
                windows_positive as f64 / windows_total as f64
            } else {
                0.0
            };

            table.push(StabilityRow {
                strategy: strategy.clone(),
                split_count: split_n,
                survival_rate,
                pnl_variance: sample_variance(&window_pnls),
                worst_window_pnl: window_pnls.iter().copied().fold(f64::INFINITY, f64::min),
                best_window_pnl: window_pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                median_window_pnl: median(&window_pnls),
                windows_positive,
                windows_total,
                trades_total,
                hit_rate_x2: runner.as_ref().map(|m| m.hit_rate_x2),
                hit_rate_x4: runner.as_ref().map(|m| m.hit_rate_x4),
                hit_rate_x5: runner.as_ref().map(|m| m.hit_rate_x5),
                p90_hold_days: runner.as_ref().map(|m| m.p90_hold_days),
                tail_contribution: runner.as_ref().map(|m| m.tail_contribution),
                tail_pnl_share: runner.as_ref().map(|m| m.tail_pnl_share),
                non_tail_pnl_share: runner.as_ref().map(|m| m.non_tail_pnl_share),
                max_drawdown_pct: runner.as_ref().map(|m| m.max_drawdown_pct),
            });
        }
    }
    table
}

/// Reads `portfolio_summary.csv` into strategy -> max_drawdown_pct.
pub fn load_summary_drawdowns(path: &Path) -> Result<HashMap<String, f64>, StageError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let strategy_idx = headers.iter().position(|h| h == "strategy");
    let dd_idx = headers.iter().position(|h| h == "max_drawdown_pct");
    let mut map = HashMap::new();
    if let (Some(si), Some(di)) = (strategy_idx, dd_idx) {
        for record in reader.records() {
            let record = record?;
            if let (Some(strategy), Some(dd)) = (record.get(si), record.get(di)) {
                if let Ok(value) = dd.trim().parse::<f64>() {
                    map.insert(strategy.to_string(), value);
                }
            }
        }
    }
    Ok(map)
}
