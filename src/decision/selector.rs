use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::research::{is_runner_strategy, StabilityRow, StageError};

use super::rules::SelectionCriteria;

/// One normalized stability-table row entering the gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub strategy: String,
    pub split_n: Option<usize>,
    pub split_count: Option<usize>,
    pub survival_rate: f64,
    pub pnl_variance: f64,
    pub worst_window_pnl: f64,
    pub best_window_pnl: f64,
    pub median_window_pnl: f64,
    pub windows_total: usize,
    pub windows_positive: usize,
    pub trades_total: usize,
    pub hit_rate_x2: Option<f64>,
    pub hit_rate_x4: Option<f64>,
    pub hit_rate_x5: Option<f64>,
    pub p90_hold_days: Option<f64>,
    pub tail_contribution: Option<f64>,
    pub tail_pnl_share: Option<f64>,
    pub non_tail_pnl_share: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
}

/// Stability table plus whether it carries v2 Runner columns. V2 activation
/// is decided by column presence, never by deriving the values on the fly.
#[derive(Debug, Clone)]
pub struct SelectionInput {
    pub records: Vec<SelectionRecord>,
    pub has_v2_columns: bool,
}

impl SelectionInput {
    pub fn from_stability_rows(rows: &[StabilityRow]) -> Self {
        let has_v2_columns = rows.iter().any(|r| {
            r.hit_rate_x4.is_some() || r.tail_pnl_share.is_some() || r.non_tail_pnl_share.is_some()
        });
        let records = rows
            .iter()
            .map(|r| {
                normalize(SelectionRecord {
                    strategy: r.strategy.clone(),
                    split_n: None,
                    split_count: Some(r.split_count),
                    survival_rate: r.survival_rate,
                    pnl_variance: r.pnl_variance,
                    worst_window_pnl: r.worst_window_pnl,
                    best_window_pnl: r.best_window_pnl,
                    median_window_pnl: r.median_window_pnl,
                    windows_total: r.windows_total,
                    windows_positive: r.windows_positive,
                    trades_total: r.trades_total,
                    hit_rate_x2: r.hit_rate_x2,
                    hit_rate_x4: r.hit_rate_x4,
                    hit_rate_x5: r.hit_rate_x5,
                    p90_hold_days: r.p90_hold_days,
                    tail_contribution: r.tail_contribution,
                    tail_pnl_share: r.tail_pnl_share,
                    non_tail_pnl_share: r.non_tail_pnl_share,
                    max_drawdown_pct: r.max_drawdown_pct,
                })
            })
            .collect();
        Self {
            records,
            has_v2_columns,
        }
    }
}

/// One output row: the normalized metrics plus the verdict. Input order is
/// preserved and nothing is re-sorted or filtered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRow {
    #[serde(flatten)]
    pub record: SelectionRecord,
    pub passed: bool,
    pub failed_reasons: Vec<String>,
}

/// Schema normalization: both split spellings, windows_total from the split
/// count, windows_positive reconstructed from the survival rate and clamped
/// into [0, windows_total], NaNs in critical metrics zeroed.
fn normalize(mut record: SelectionRecord) -> SelectionRecord {
    match (record.split_count, record.split_n) {
        (Some(c), None) => record.split_n = Some(c),
        (None, Some(n)) => record.split_count = Some(n),
        _ => {}
    }
    if record.windows_total == 0 {
        if let Some(split) = record.split_n.or(record.split_count) {
            record.windows_total = split;
        }
    }
    for value in [
        &mut record.survival_rate,
        &mut record.pnl_variance,
        &mut record.worst_window_pnl,
        &mut record.best_window_pnl,
        &mut record.median_window_pnl,
    ] {
        if value.is_nan() {
            *value = 0.0;
        }
    }
    for value in [
        &mut record.hit_rate_x2,
        &mut record.hit_rate_x4,
        &mut record.hit_rate_x5,
        &mut record.tail_contribution,
        &mut record.tail_pnl_share,
        &mut record.non_tail_pnl_share,
        &mut record.max_drawdown_pct,
    ] {
        if value.map_or(false, f64::is_nan) {
            *value = Some(0.0);
        }
    }
    if record.windows_positive == 0 && record.survival_rate > 0.0 {
        let computed = (record.survival_rate * record.windows_total as f64).round() as i64;
        record.windows_positive = computed.clamp(0, record.windows_total as i64) as usize;
    }
    record.windows_positive = record.windows_positive.min(record.windows_total);
    record
}

/// Applies the criteria to every row. Runner rows use v2 criteria when the
/// table carries v2 columns, v1 otherwise; everything else is RR/RRD.
pub fn select_strategies(
    input: &SelectionInput,
    rr_criteria: &SelectionCriteria,
    runner_v1: &SelectionCriteria,
    runner_v2: &SelectionCriteria,
) -> Vec<SelectionRow> {
    input
        .records
        .iter()
        .map(|record| {
            let failed_reasons = if is_runner_strategy(&record.strategy) {
                let criteria = if input.has_v2_columns { runner_v2 } else { runner_v1 };
                check_runner(record, criteria)
            } else {
                check_rr(record, rr_criteria)
            };
            SelectionRow {
                passed: failed_reasons.is_empty(),
                failed_reasons,
                record: record.clone(),
            }
        })
        .collect()
}

fn check_rr(record: &SelectionRecord, criteria: &SelectionCriteria) -> Vec<String> {
    let mut failed = Vec::new();
    if record.survival_rate < criteria.min_survival_rate {
        failed.push(format!(
            "survival_rate {:.3} < {}",
            record.survival_rate, criteria.min_survival_rate
        ));
    }
    if record.pnl_variance > criteria.max_pnl_variance {
        failed.push(format!(
            "pnl_variance {:.6} > {}",
            record.pnl_variance, criteria.max_pnl_variance
        ));
    }
    if record.worst_window_pnl < criteria.min_worst_window_pnl {
        failed.push(format!(
            "worst_window_pnl {:.4} < {}",
            record.worst_window_pnl, criteria.min_worst_window_pnl
        ));
    }
    if record.median_window_pnl < criteria.min_median_window_pnl {
        failed.push(format!(
            "median_window_pnl {:.4} < {}",
            record.median_window_pnl, criteria.min_median_window_pnl
        ));
    }
    if record.windows_total < criteria.min_windows {
        failed.push(format!(
            "windows_total {} < {}",
            record.windows_total, criteria.min_windows
        ));
    }
    failed
}

fn check_runner(record: &SelectionRecord, criteria: &SelectionCriteria) -> Vec<String> {
    let mut failed = Vec::new();

    if criteria.is_v2() {
        if let Some(min) = criteria.min_hit_rate_x4 {
            match record.hit_rate_x4 {
                None => failed.push("missing_hit_rate_x4".to_string()),
                Some(v) if v < min => {
                    failed.push(format!("hit_rate_x4 {:.3} < {}", v, min));
                }
                _ => {}
            }
        }
        if let Some(min) = criteria.min_tail_pnl_share {
            match record.tail_pnl_share {
                None => failed.push("missing_tail_pnl_share".to_string()),
                Some(v) if v < min => {
                    failed.push(format!("tail_pnl_share {:.3} < {}", v, min));
                }
                _ => {}
            }
        }
        if let Some(min) = criteria.min_non_tail_pnl_share {
            match record.non_tail_pnl_share {
                None => failed.push("missing_non_tail_pnl_share".to_string()),
                Some(v) if v < min => {
                    failed.push(format!("non_tail_pnl_share {:.3} < {}", v, min));
                }
                _ => {}
            }
        }
    } else {
        if let Some(min) = criteria.min_hit_rate_x2 {
            let v = record.hit_rate_x2.unwrap_or(0.0);
            if v < min {
                failed.push(format!("hit_rate_x2 {:.3} < {}", v, min));
            }
        }
        if let Some(min) = criteria.min_hit_rate_x5 {
            let v = record.hit_rate_x5.unwrap_or(0.0);
            if v < min {
                failed.push(format!("hit_rate_x5 {:.3} < {}", v, min));
            }
        }
        if let Some(max) = criteria.max_p90_hold_days {
            // Optional field: absent means the check is skipped, not failed.
            if let Some(v) = record.p90_hold_days {
                if v > max {
                    failed.push(format!("p90_hold_days {:.2} > {}", v, max));
                }
            }
        }
        if let Some(max) = criteria.max_tail_contribution {
            if let Some(v) = record.tail_contribution {
                if v > max {
                    failed.push(format!("tail_contribution {:.3} > {}", v, max));
                }
            }
        }
    }

    if let Some(threshold) = criteria.max_drawdown_pct {
        if let Some(v) = record.max_drawdown_pct {
            if v < threshold {
                failed.push(format!("max_drawdown_pct {:.3} < {}", v, threshold));
            }
        }
    }
    failed
}

/// Loads a stability CSV tolerantly: unknown columns are ignored, v2
/// activation is read off the header set.
pub fn load_stability_csv(path: &Path) -> Result<SelectionInput, StageError> {
    if !path.exists() {
        return Err(StageError::NotFound(path.display().to_string()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if !headers.iter().any(|h| h == "strategy") {
        return Err(StageError::MissingColumn {
            column: "strategy".to_string(),
            path: path.display().to_string(),
        });
    }
    let has_v2_columns = headers
        .iter()
        .any(|h| matches!(h.as_str(), "hit_rate_x4" | "tail_pnl_share" | "non_tail_pnl_share"));

    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.as_str(), i))
        .collect();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw = |name: &str| -> Option<&str> {
            index
                .get(name)
                .and_then(|i| record.get(*i))
                .map(str::trim)
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
        };
        let float = |name: &str| raw(name).and_then(|v| v.parse::<f64>().ok());
        let int = |name: &str| raw(name).and_then(|v| v.parse::<f64>().ok()).map(|v| v as usize);

        records.push(normalize(SelectionRecord {
            strategy: raw("strategy").unwrap_or("").to_string(),
            split_n: int("split_n"),
            split_count: int("split_count"),
            survival_rate: float("survival_rate").unwrap_or(0.0),
            pnl_variance: float("pnl_variance").unwrap_or(0.0),
            worst_window_pnl: float("worst_window_pnl").unwrap_or(0.0),
            best_window_pnl: float("best_window_pnl").unwrap_or(0.0),
            median_window_pnl: float("median_window_pnl").unwrap_or(0.0),
            windows_total: int("windows_total").unwrap_or(0),
            windows_positive: int("windows_positive").unwrap_or(0),
            trades_total: int("trades_total").unwrap_or(0),
            hit_rate_x2: float("hit_rate_x2"),
            hit_rate_x4: float("hit_rate_x4"),
            hit_rate_x5: float("hit_rate_x5"),
            p90_hold_days: float("p90_hold_days"),
            tail_contribution: float("tail_contribution"),
            tail_pnl_share: float("tail_pnl_share"),
            non_tail_pnl_share: float("non_tail_pnl_share"),
            max_drawdown_pct: float("max_drawdown_pct"),
        }));
    }
    info!(
        "loaded {} stability rows from {} (v2 columns: {})",
        records.len(),
        path.display(),
        has_v2_columns
    );
    Ok(SelectionInput {
        records,
        has_v2_columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_record() -> SelectionRecord {
        SelectionRecord {
            strategy: "runner_ladder".to_string(),
            split_count: Some(4),
            windows_total: 4,
            ..SelectionRecord::default()
        }
    }

    fn v2_input(records: Vec<SelectionRecord>) -> SelectionInput {
        SelectionInput {
            records,
            has_v2_columns: true,
        }
    }

    fn gate(input: &SelectionInput) -> Vec<SelectionRow> {
        select_strategies(
            input,
            &SelectionCriteria::rr_v1(),
            &SelectionCriteria::runner_v1(),
            &SelectionCriteria::runner_v2(),
        )
    }

    #[test]
    fn test_v2_gate_passes_good_runner() {
        let mut record = runner_record();
        record.hit_rate_x4 = Some(0.20);
        record.tail_pnl_share = Some(0.70);
        record.non_tail_pnl_share = Some(0.30);
        record.max_drawdown_pct = Some(-0.30);
        let rows = gate(&v2_input(vec![record]));
        assert!(rows[0].passed, "reasons: {:?}", rows[0].failed_reasons);
    }

    #[test]
    fn test_v2_gate_fails_on_tail_share_without_mentioning_legacy() {
        let mut record = runner_record();
        record.hit_rate_x4 = Some(0.20);
        record.tail_pnl_share = Some(0.10);
        record.non_tail_pnl_share = Some(0.30);
        record.max_drawdown_pct = Some(-0.30);
        // A legacy value is present but must be ignored in v2 mode.
        record.tail_contribution = Some(0.99);
        record.p90_hold_days = Some(99.0);
        let rows = gate(&v2_input(vec![record]));
        assert!(!rows[0].passed);
        let joined = rows[0].failed_reasons.join("; ");
        assert!(joined.contains("tail_pnl_share"));
        assert!(!joined.contains("tail_contribution"));
        assert!(!joined.contains("p90_hold_days"));
    }

    #[test]
    fn test_v1_gate_never_fails_on_v2_reasons() {
        let mut record = runner_record();
        record.hit_rate_x2 = Some(0.50);
        record.hit_rate_x5 = Some(0.10);
        record.p90_hold_days = Some(10.0);
        record.tail_contribution = Some(0.50);
        record.max_drawdown_pct = Some(-0.30);
        let input = SelectionInput {
            records: vec![record],
            has_v2_columns: false,
        };
        let rows = gate(&input);
        assert!(rows[0].passed, "reasons: {:?}", rows[0].failed_reasons);
    }

    #[test]
    fn test_missing_v2_metric_produces_missing_reason() {
        let mut record = runner_record();
        record.tail_pnl_share = Some(0.70);
        record.non_tail_pnl_share = Some(0.30);
        // hit_rate_x4 absent while the table claims v2 columns.
        let rows = gate(&v2_input(vec![record]));
        assert!(!rows[0].passed);
        assert!(rows[0]
            .failed_reasons
            .contains(&"missing_hit_rate_x4".to_string()));
    }

    #[test]
    fn test_rr_gate_reasons_name_metric_and_threshold() {
        let record = SelectionRecord {
            strategy: "momentum".to_string(),
            split_count: Some(4),
            windows_total: 4,
            survival_rate: 0.25,
            pnl_variance: 0.5,
            worst_window_pnl: -0.9,
            median_window_pnl: -0.1,
            ..SelectionRecord::default()
        };
        let input = SelectionInput {
            records: vec![record],
            has_v2_columns: false,
        };
        let rows = gate(&input);
        assert!(!rows[0].passed);
        let joined = rows[0].failed_reasons.join("; ");
        assert!(joined.contains("survival_rate 0.250 < 0.6"));
        assert!(joined.contains("pnl_variance 0.500000 > 0.15"));
        assert!(joined.contains("worst_window_pnl -0.9000 < -0.25"));
        assert!(joined.contains("median_window_pnl -0.1000 < 0"));
    }

    #[test]
    fn test_input_order_is_preserved() {
        let mut a = runner_record();
        a.strategy = "runner_z".to_string();
        let mut b = runner_record();
        b.strategy = "runner_a".to_string();
        let rows = gate(&v2_input(vec![a, b]));
        assert_eq!(rows[0].record.strategy, "runner_z");
        assert_eq!(rows[1].record.strategy, "runner_a");
    }

    #[test]
    fn test_normalize_fills_windows_positive_and_clamps() {
        let record = normalize(SelectionRecord {
            strategy: "runner".to_string(),
            split_count: Some(5),
            survival_rate: 0.9,
            ..SelectionRecord::default()
        });
        assert_eq!(record.split_n, Some(5));
        assert_eq!(record.windows_total, 5);
        // round(0.9 * 5) = 5 -> clamped within windows_total.
        assert_eq!(record.windows_positive, 5);
    }

    #[test]
    fn test_normalize_zeroes_nans() {
        let record = normalize(SelectionRecord {
            strategy: "runner".to_string(),
            survival_rate: f64::NAN,
            hit_rate_x4: Some(f64::NAN),
            ..SelectionRecord::default()
        });
        assert_eq!(record.survival_rate, 0.0);
        assert_eq!(record.hit_rate_x4, Some(0.0));
    }

    #[test]
    fn test_load_stability_csv_detects_v2_columns() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "strategy,split_count,survival_rate,pnl_variance,worst_window_pnl,\
             median_window_pnl,windows_total,hit_rate_x4,tail_pnl_share\n\
             runner_a,3,0.66,0.01,-0.1,0.2,3,0.2,0.5"
        )
        .unwrap();
        let input = load_stability_csv(f.path()).unwrap();
        assert!(input.has_v2_columns);
        assert_eq!(input.records.len(), 1);
        assert_eq!(input.records[0].split_n, Some(3));
    }
}
