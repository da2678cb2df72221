use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::decision::SelectionRow;
use crate::engine::PortfolioResult;
use crate::research::StabilityRow;
use crate::types::PositionStatus;

/// Writes the report bundle: portfolio tables, stability and selection CSVs.
/// Column order follows the persisted contract (position_id first in the
/// positions table).
pub struct Reporter {
    output_dir: PathBuf,
}

const POSITIONS_COLUMNS: [&str; 24] = [
    "position_id",
    "strategy",
    "signal_id",
    "contract_address",
    "entry_time",
    "exit_time",
    "status",
    "size",
    "pnl_sol",
    "fees_total_sol",
    "exec_entry_price",
    "exec_exit_price",
    "raw_entry_price",
    "raw_exit_price",
    "closed_by_reset",
    "triggered_portfolio_reset",
    "reset_reason",
    "hold_minutes",
    "max_xn_reached",
    "hit_x2",
    "hit_x4",
    "hit_x5",
    "realized_total_pnl_sol",
    "realized_tail_pnl_sol",
];

impl Reporter {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn writer(&self, file: &str) -> Result<csv::Writer<fs::File>> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("cannot create {}", self.output_dir.display()))?;
        let path = self.output_dir.join(file);
        csv::Writer::from_path(&path).with_context(|| format!("cannot write {}", path.display()))
    }

    /// One row per closed position, `position_id` first.
    pub fn save_portfolio_positions(
        &self,
        results: &BTreeMap<String, PortfolioResult>,
    ) -> Result<PathBuf> {
        let mut writer = self.writer("portfolio_positions.csv")?;
        writer.write_record(POSITIONS_COLUMNS)?;
        for result in results.values() {
            for p in result
                .positions
                .iter()
                .filter(|p| p.status == PositionStatus::Closed)
            {
                writer.write_record([
                    p.position_id.clone(),
                    p.strategy.clone(),
                    p.signal_id.clone(),
                    p.contract_address.clone(),
                    time_cell(Some(p.entry_time)),
                    time_cell(p.exit_time),
                    p.status.as_str().to_string(),
                    p.size.to_string(),
                    p.pnl_sol.to_string(),
                    p.fees_total_sol.to_string(),
                    p.exec_entry_price.to_string(),
                    p.exec_exit_price.map(|v| v.to_string()).unwrap_or_default(),
                    p.raw_entry_price.to_string(),
                    p.raw_exit_price.map(|v| v.to_string()).unwrap_or_default(),
                    p.closed_by_reset.to_string(),
                    p.triggered_portfolio_reset.to_string(),
                    p.reset_reason.clone().unwrap_or_default(),
                    p.hold_minutes.to_string(),
                    p.max_xn_reached.to_string(),
                    p.hit_x2().to_string(),
                    p.hit_x4().to_string(),
                    p.hit_x5().to_string(),
                    p.realized_total_pnl_sol.to_string(),
                    p.realized_tail_pnl_sol.to_string(),
                ])?;
            }
        }
        writer.flush()?;
        let path = self.output_dir.join("portfolio_positions.csv");
        info!("saved portfolio positions to {}", path.display());
        Ok(path)
    }

    /// One row per execution leg.
    pub fn save_portfolio_executions(
        &self,
        results: &BTreeMap<String, PortfolioResult>,
    ) -> Result<PathBuf> {
        let mut writer = self.writer("portfolio_executions.csv")?;
        writer.write_record([
            "position_id",
            "signal_id",
            "strategy",
            "event_time",
            "event_type",
            "qty_delta",
            "raw_price",
            "exec_price",
            "fees_sol",
            "pnl_sol_delta",
            "reset_reason",
        ])?;
        for result in results.values() {
            for x in &result.executions {
                writer.write_record([
                    x.position_id.clone(),
                    x.signal_id.clone(),
                    x.strategy.clone(),
                    time_cell(Some(x.event_time)),
                    x.event_type.as_str().to_string(),
                    x.qty_delta.to_string(),
                    x.raw_price.to_string(),
                    x.exec_price.to_string(),
                    x.fees_sol.to_string(),
                    x.pnl_sol_delta.to_string(),
                    x.reset_reason.clone().unwrap_or_default(),
                ])?;
            }
        }
        writer.flush()?;
        let path = self.output_dir.join("portfolio_executions.csv");
        info!("saved portfolio executions to {}", path.display());
        Ok(path)
    }

    /// The typed event ledger.
    pub fn save_portfolio_events(
        &self,
        results: &BTreeMap<String, PortfolioResult>,
    ) -> Result<PathBuf> {
        let mut writer = self.writer("portfolio_events.csv")?;
        writer.write_record([
            "event_type",
            "timestamp",
            "position_id",
            "signal_id",
            "reason",
            "meta",
        ])?;
        for result in results.values() {
            for e in &result.events {
                let meta = if e.meta.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&e.meta).unwrap_or_default()
                };
                writer.write_record([
                    e.event_type.as_str().to_string(),
                    time_cell(Some(e.timestamp)),
                    e.position_id.clone().unwrap_or_default(),
                    e.signal_id.clone().unwrap_or_default(),
                    e.reason.clone(),
                    meta,
                ])?;
            }
        }
        writer.flush()?;
        let path = self.output_dir.join("portfolio_events.csv");
        info!("saved portfolio events to {}", path.display());
        Ok(path)
    }

    /// One row per strategy, with the legacy reset_count/last_reset_time
    /// aliases alongside the canonical columns.
    pub fn save_portfolio_summary(
        &self,
        results: &BTreeMap<String, PortfolioResult>,
    ) -> Result<PathBuf> {
        let mut writer = self.writer("portfolio_summary.csv")?;
        writer.write_record([
            "strategy",
            "final_balance_sol",
            "total_return_pct",
            "max_drawdown_pct",
            "trades_executed",
            "trades_skipped_by_risk",
            "trades_skipped_by_reset",
            "portfolio_reset_count",
            "last_portfolio_reset_time",
            "cycle_start_equity",
            "equity_peak_in_cycle",
            "reset_count",
            "last_reset_time",
        ])?;
        for (strategy, result) in results {
            let s = &result.stats;
            writer.write_record([
                strategy.clone(),
                s.final_balance_sol.to_string(),
                s.total_return_pct.to_string(),
                s.max_drawdown_pct.to_string(),
                s.trades_executed.to_string(),
                s.trades_skipped_by_risk.to_string(),
                s.trades_skipped_by_reset.to_string(),
                s.portfolio_reset_count.to_string(),
                time_cell(s.last_portfolio_reset_time),
                s.cycle_start_equity.to_string(),
                s.equity_peak_in_cycle.to_string(),
                s.reset_count().to_string(),
                time_cell(s.last_reset_time()),
            ])?;
        }
        writer.flush()?;
        let path = self.output_dir.join("portfolio_summary.csv");
        info!("saved portfolio summary to {}", path.display());
        Ok(path)
    }

    /// Stability table; Runner metric columns appear only when some row
    /// carries them, so a Runner-less table never advertises v2 columns.
    pub fn save_stability(&self, rows: &[StabilityRow]) -> Result<PathBuf> {
        let has_runner_metrics = rows.iter().any(|r| r.hit_rate_x2.is_some());
        let mut writer = self.writer("strategy_stability.csv")?;

        let mut header = vec![
            "strategy",
            "split_count",
            "survival_rate",
            "pnl_variance",
            "worst_window_pnl",
            "best_window_pnl",
            "median_window_pnl",
            "windows_positive",
            "windows_total",
            "trades_total",
        ];
        if has_runner_metrics {
            header.extend([
                "hit_rate_x2",
                "hit_rate_x5",
                "hit_rate_x4",
                "p90_hold_days",
                "tail_contribution",
                "tail_pnl_share",
                "non_tail_pnl_share",
                "max_drawdown_pct",
            ]);
        }
        writer.write_record(&header)?;

        for r in rows {
            let mut record = vec![
                r.strategy.clone(),
                r.split_count.to_string(),
                r.survival_rate.to_string(),
                r.pnl_variance.to_string(),
                r.worst_window_pnl.to_string(),
                r.best_window_pnl.to_string(),
                r.median_window_pnl.to_string(),
                r.windows_positive.to_string(),
                r.windows_total.to_string(),
                r.trades_total.to_string(),
            ];
            if has_runner_metrics {
                record.extend([
                    float_cell(r.hit_rate_x2),
                    float_cell(r.hit_rate_x5),
                    float_cell(r.hit_rate_x4),
                    float_cell(r.p90_hold_days),
                    float_cell(r.tail_contribution),
                    float_cell(r.tail_pnl_share),
                    float_cell(r.non_tail_pnl_share),
                    float_cell(r.max_drawdown_pct),
                ]);
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        let path = self.output_dir.join("strategy_stability.csv");
        info!("saved strategy stability table to {}", path.display());
        Ok(path)
    }

    /// Selection table in input order; failed_reasons "; "-joined.
    pub fn save_selection(&self, rows: &[SelectionRow]) -> Result<PathBuf> {
        let mut writer = self.writer("strategy_selection.csv")?;
        writer.write_record([
            "strategy",
            "split_n",
            "split_count",
            "survival_rate",
            "pnl_variance",
            "worst_window_pnl",
            "best_window_pnl",
            "median_window_pnl",
            "windows_positive",
            "windows_total",
            "trades_total",
            "hit_rate_x2",
            "hit_rate_x4",
            "hit_rate_x5",
            "p90_hold_days",
            "tail_contribution",
            "tail_pnl_share",
            "non_tail_pnl_share",
            "max_drawdown_pct",
            "passed",
            "failed_reasons",
        ])?;
        for row in rows {
            let r = &row.record;
            writer.write_record([
                r.strategy.clone(),
                r.split_n.map(|v| v.to_string()).unwrap_or_default(),
                r.split_count.map(|v| v.to_string()).unwrap_or_default(),
                r.survival_rate.to_string(),
                r.pnl_variance.to_string(),
                r.worst_window_pnl.to_string(),
                r.best_window_pnl.to_string(),
                r.median_window_pnl.to_string(),
                r.windows_positive.to_string(),
                r.windows_total.to_string(),
                r.trades_total.to_string(),
                float_cell(r.hit_rate_x2),
                float_cell(r.hit_rate_x4),
                float_cell(r.hit_rate_x5),
                float_cell(r.p90_hold_days),
                float_cell(r.tail_contribution),
                float_cell(r.tail_pnl_share),
                float_cell(r.non_tail_pnl_share),
                float_cell(r.max_drawdown_pct),
                row.passed.to_string(),
                row.failed_reasons.join("; "),
            ])?;
        }
        writer.flush()?;
        let path = self.output_dir.join("strategy_selection.csv");
        info!("saved strategy selection table to {}", path.display());
        Ok(path)
    }
}

fn time_cell(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn float_cell(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PortfolioConfig, PortfolioEngine};
    use crate::research::load_positions_csv;
    use crate::types::{SignalResult, StrategyOutput};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn sample_result() -> PortfolioResult {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let output = StrategyOutput {
            entry_time: Some(base),
            entry_price: Some(dec!(1.0)),
            exit_time: Some(base + chrono::Duration::hours(2)),
            exit_price: Some(dec!(1.3)),
            pnl: dec!(0.3),
            reason: "tp".to_string(),
            ladder: None,
            meta: HashMap::new(),
        };
        let results = vec![SignalResult {
            signal_id: "s1".to_string(),
            contract_address: "TOKEN1".to_string(),
            strategy: "runner_test".to_string(),
            timestamp: base,
            output,
        }];
        let engine = PortfolioEngine::new(PortfolioConfig::basic(dec!(10.0), dec!(0.1)));
        engine.simulate(&results, "runner_test")
    }

    #[test]
    fn test_positions_table_round_trips_through_stage_a_loader() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());
        let mut results = BTreeMap::new();
        results.insert("runner_test".to_string(), sample_result());

        let path = reporter.save_portfolio_positions(&results).unwrap();
        let rows = load_positions_csv(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_closed());
        assert_eq!(rows[0].strategy, "runner_test");
        assert!(rows[0].pnl_sol.is_some());

        // position_id is the first column.
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("position_id,"));
    }

    #[test]
    fn test_executions_fees_match_position_totals() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());
        let result = sample_result();
        let position = result.positions[0].clone();
        let mut results = BTreeMap::new();
        results.insert("runner_test".to_string(), result);

        reporter.save_portfolio_executions(&results).unwrap();
        let content =
            fs::read_to_string(dir.path().join("portfolio_executions.csv")).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let headers = reader.headers().unwrap().clone();
        let fee_idx = headers.iter().position(|h| h == "fees_sol").unwrap();
        let pid_idx = headers.iter().position(|h| h == "position_id").unwrap();
        let mut fee_sum = 0.0f64;
        for record in reader.records() {
            let record = record.unwrap();
            if record.get(pid_idx) == Some(position.position_id.as_str()) {
                fee_sum += record.get(fee_idx).unwrap().parse::<f64>().unwrap();
            }
        }
        let expected: f64 = position.fees_total_sol.to_string().parse().unwrap();
        assert!((fee_sum - expected).abs() < 1e-9);
    }

    #[test]
    fn test_summary_carries_alias_columns() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());
        let mut results = BTreeMap::new();
        results.insert("runner_test".to_string(), sample_result());
        reporter.save_portfolio_summary(&results).unwrap();

        let content = fs::read_to_string(dir.path().join("portfolio_summary.csv")).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.contains("portfolio_reset_count"));
        assert!(header.contains("reset_count"));
        assert!(header.contains("last_reset_time"));
    }

    #[test]
    fn test_stability_table_omits_runner_columns_without_runners() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());
        let rows = vec![StabilityRow {
            strategy: "momentum".to_string(),
            split_count: 3,
            survival_rate: 0.66,
            pnl_variance: 0.01,
            worst_window_pnl: -0.1,
            best_window_pnl: 0.4,
            median_window_pnl: 0.2,
            windows_positive: 2,
            windows_total: 3,
            trades_total: 9,
            hit_rate_x2: None,
            hit_rate_x4: None,
            hit_rate_x5: None,
            p90_hold_days: None,
            tail_contribution: None,
            tail_pnl_share: None,
            non_tail_pnl_share: None,
            max_drawdown_pct: None,
        }];
        reporter.save_stability(&rows).unwrap();
        let content = fs::read_to_string(dir.path().join("strategy_stability.csv")).unwrap();
        let header = content.lines().next().unwrap();
        assert!(!header.contains("hit_rate_x4"));
        assert!(!header.contains("tail_pnl_share"));
    }
}
