use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use super::StageError;

/// One row of the executed-positions table, parsed tolerantly: optional
/// columns simply stay None so old report bundles keep working.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub position_id: Option<String>,
    pub strategy: String,
    pub signal_id: Option<String>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: String,
    pub pnl_sol: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub hold_minutes: Option<f64>,
    pub max_xn_reached: Option<f64>,
    pub hit_x2: Option<bool>,
    pub hit_x4: Option<bool>,
    pub hit_x5: Option<bool>,
    pub realized_total_pnl_sol: Option<f64>,
    pub realized_tail_pnl_sol: Option<f64>,
    pub exec_entry_price: Option<f64>,
    pub exec_exit_price: Option<f64>,
    pub raw_entry_price: Option<f64>,
    pub raw_exit_price: Option<f64>,
}

impl PositionRow {
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }

    /// Chosen PnL value: SOL when present, percent otherwise.
    pub fn pnl_value(&self) -> f64 {
        self.pnl_sol.or(self.pnl_pct).unwrap_or(0.0)
    }

    /// Realized price multiple, falling back from exec to raw prices.
    pub fn max_xn(&self) -> Option<f64> {
        if let Some(xn) = self.max_xn_reached {
            return Some(xn);
        }
        if let (Some(entry), Some(exit)) = (self.exec_entry_price, self.exec_exit_price) {
            if entry > 0.0 {
                return Some(exit / entry);
            }
        }
        if let (Some(entry), Some(exit)) = (self.raw_entry_price, self.raw_exit_price) {
            if entry > 0.0 {
                return Some(exit / entry);
            }
        }
        None
    }
}

const REQUIRED_COLUMNS: [&str; 4] = ["strategy", "entry_time", "exit_time", "status"];

/// Loads and shape-checks a positions-level CSV.
///
/// An `event_type` column marks an executions-level table and is rejected
/// before anything else, so no output is ever produced from the wrong input.
pub fn load_positions_csv(path: &Path) -> Result<Vec<PositionRow>, StageError> {
    if !path.exists() {
        return Err(StageError::NotFound(path.display().to_string()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    if headers.iter().any(|h| h == "event_type") {
        return Err(StageError::ExecutionsLevelInput {
            column: "event_type".to_string(),
        });
    }
    for required in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == required) {
            return Err(StageError::MissingColumn {
                column: required.to_string(),
                path: path.display().to_string(),
            });
        }
    }
    if !headers.iter().any(|h| h == "pnl_sol" || h == "pnl_pct") {
        return Err(StageError::MissingColumn {
            column: "pnl_sol".to_string(),
            path: path.display().to_string(),
        });
    }

    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.as_str(), i))
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let raw = |name: &str| -> Option<&str> {
            index
                .get(name)
                .and_then(|i| record.get(*i))
                .map(str::trim)
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
        };
        let float = |name: &str| raw(name).and_then(|v| v.parse::<f64>().ok());
        let flag = |name: &str| {
            raw(name).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        };

        let entry_time = match raw("entry_time").map(parse_time) {
            Some(Ok(t)) => t,
            Some(Err(detail)) => {
                return Err(StageError::BadValue {
                    row: line + 2,
                    column: "entry_time".to_string(),
                    detail,
                })
            }
            None => {
                return Err(StageError::BadValue {
                    row: line + 2,
                    column: "entry_time".to_string(),
                    detail: "empty".to_string(),
                })
            }
        };
        let exit_time = match raw("exit_time").map(parse_time) {
            Some(Ok(t)) => Some(t),
            Some(Err(detail)) => {
                return Err(StageError::BadValue {
                    row: line + 2,
                    column: "exit_time".to_string(),
                    detail,
                })
            }
            None => None,
        };

        rows.push(PositionRow {
            position_id: raw("position_id").map(str::to_string),
            strategy: raw("strategy").unwrap_or("").to_string(),
            signal_id: raw("signal_id").map(str::to_string),
            entry_time,
            exit_time,
            status: raw("status").unwrap_or("").to_string(),
            pnl_sol: float("pnl_sol"),
            pnl_pct: float("pnl_pct"),
            hold_minutes: float("hold_minutes"),
            max_xn_reached: float("max_xn_reached").or(float("max_xn")),
            hit_x2: flag("hit_x2"),
            hit_x4: flag("hit_x4"),
            hit_x5: flag("hit_x5"),
            realized_total_pnl_sol: float("realized_total_pnl_sol"),
            realized_tail_pnl_sol: float("realized_tail_pnl_sol"),
            exec_entry_price: float("exec_entry_price"),
            exec_exit_price: float("exec_exit_price"),
            raw_entry_price: float("raw_entry_price"),
            raw_exit_price: float("raw_exit_price"),
        });
    }
    info!("loaded {} position rows from {}", rows.len(), path.display());
    Ok(rows)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|t| t.and_utc())
        })
        .map_err(|e| format!("{} ({})", raw, e))
}

/// One equal-duration window of the split.
#[derive(Debug, Clone)]
pub struct WindowSlice {
    pub window_index: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Indices into the input row slice. Empty windows stay in the output.
    pub rows: Vec<usize>,
}

/// Splits positions into exactly `split_n` equal-duration windows spanning
/// [min entry_time, max exit_time]. A position belongs to the window holding
/// its entry_time; the last window is closed on the right.
pub fn split_into_equal_windows(rows: &[PositionRow], split_n: usize) -> Vec<WindowSlice> {
    if rows.is_empty() || split_n == 0 {
        return Vec::new();
    }
    let t_min = rows.iter().map(|r| r.entry_time).min().expect("non-empty rows");
    let t_max = rows
        .iter()
        .map(|r| r.exit_time.unwrap_or(r.entry_time))
        .max()
        .expect("non-empty rows");
    let span = t_max - t_min;
    let width = span / split_n as i32;

    let mut windows: Vec<WindowSlice> = (0..split_n)
        .map(|i| {
            let start = t_min + width * i as i32;
            let end = if i == split_n - 1 { t_max } else { t_min + width * (i as i32 + 1) };
            WindowSlice {
                window_index: i,
                window_start: start,
                window_end: end,
                rows: Vec::new(),
            }
        })
        .collect();

    for (idx, row) in rows.iter().enumerate() {
        let position = row.entry_time;
        let mut assigned = false;
        for (i, window) in windows.iter_mut().enumerate() {
            let in_window = if i == split_n - 1 {
                position >= window.window_start && position <= window.window_end
            } else {
                position >= window.window_start && position < window.window_end
            };
            if in_window {
                window.rows.push(idx);
                assigned = true;
                break;
            }
        }
        if !assigned {
            // Degenerate zero-width span: everything lands in the last window.
            windows.last_mut().expect("split_n >= 1").rows.push(idx);
        }
    }
    windows
}

/// Per-window metric kernel.
#[derive(Debug, Clone, Default)]
pub struct WindowMetrics {
    pub trades_count: usize,
    /// Σ pnl over the window (SOL when available, else percent).
    pub total_pnl: f64,
    pub winrate: f64,
    pub median_pnl: f64,
    /// Max drawdown of the cumulative PnL inside the window, <= 0.
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub worst_trade: f64,
    pub best_trade: f64,
}

pub fn window_metrics(rows: &[PositionRow], indices: &[usize]) -> WindowMetrics {
    if indices.is_empty() {
        return WindowMetrics::default();
    }
    // Cumulative PnL follows entry order inside the window.
    let mut ordered: Vec<&PositionRow> = indices.iter().map(|i| &rows[*i]).collect();
    ordered.sort_by_key(|r| r.entry_time);
    let pnls: Vec<f64> = ordered.iter().map(|r| r.pnl_value()).collect();

    let trades_count = pnls.len();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

    let mut cumulative = 0.0;
    let mut running_max = 0.0_f64;
    let mut max_drawdown = 0.0_f64;
    for p in &pnls {
        cumulative += p;
        running_max = running_max.max(cumulative);
        max_drawdown = max_drawdown.min(cumulative - running_max);
    }

    let total_profit: f64 = wins.iter().sum();
    let total_loss: f64 = losses.iter().sum::<f64>().abs();
    let profit_factor = if total_loss > 0.0 {
        total_profit / total_loss
    } else if total_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    WindowMetrics {
        trades_count,
        total_pnl: pnls.iter().sum(),
        winrate: wins.len() as f64 / trades_count as f64,
        median_pnl: median(&pnls),
        max_drawdown,
        profit_factor,
        worst_trade: pnls.iter().copied().fold(f64::INFINITY, f64::min),
        best_trade: pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("no NaN in metric series"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
