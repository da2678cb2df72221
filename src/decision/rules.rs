use serde::{Deserialize, Serialize};

/// Immutable selection thresholds.
///
/// One record carries both families: RR/RRD window criteria and Runner
/// criteria (v1 hit-rate/tail fields, v2 realized-share fields). Which
/// family applies is decided per row by strategy typing; None disables the
/// individual check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    // RR/RRD criteria
    pub min_survival_rate: f64,
    pub max_pnl_variance: f64,
    pub min_worst_window_pnl: f64,
    pub min_median_window_pnl: f64,
    pub min_windows: usize,

    // Runner v1 criteria
    pub min_hit_rate_x2: Option<f64>,
    pub min_hit_rate_x5: Option<f64>,
    pub max_p90_hold_days: Option<f64>,
    pub max_tail_contribution: Option<f64>,

    // Runner v2 criteria (realized partial-exit metrics)
    pub min_hit_rate_x4: Option<f64>,
    pub min_tail_pnl_share: Option<f64>,
    pub min_non_tail_pnl_share: Option<f64>,

    // Applies to Runner rows in both versions.
    pub max_drawdown_pct: Option<f64>,
}

impl SelectionCriteria {
    /// RR/RRD v1 baseline for Stage A split counts 3/4/5.
    pub fn rr_v1() -> Self {
        Self {
            min_survival_rate: 0.60,
            max_pnl_variance: 0.15,
            min_worst_window_pnl: -0.25,
            min_median_window_pnl: 0.0,
            min_windows: 3,
            min_hit_rate_x2: None,
            min_hit_rate_x5: None,
            max_p90_hold_days: None,
            max_tail_contribution: None,
            min_hit_rate_x4: None,
            min_tail_pnl_share: None,
            min_non_tail_pnl_share: None,
            max_drawdown_pct: None,
        }
    }

    /// Runner v1 baseline: hit rates at x2/x5, hold-time and legacy tail
    /// concentration caps.
    pub fn runner_v1() -> Self {
        Self {
            min_survival_rate: 0.0,
            max_pnl_variance: f64::INFINITY,
            min_worst_window_pnl: f64::NEG_INFINITY,
            min_median_window_pnl: f64::NEG_INFINITY,
            min_windows: 1,
            min_hit_rate_x2: Some(0.35),
            min_hit_rate_x5: Some(0.08),
            max_p90_hold_days: Some(35.0),
            max_tail_contribution: Some(0.80),
            min_hit_rate_x4: None,
            min_tail_pnl_share: None,
            min_non_tail_pnl_share: None,
            max_drawdown_pct: Some(-0.60),
        }
    }

    /// Runner v2: realized partial-exit metrics; v1 fields stay disabled so
    /// their absence can never fail a row in this mode.
    pub fn runner_v2() -> Self {
        Self {
            min_survival_rate: 0.0,
            max_pnl_variance: f64::INFINITY,
            min_worst_window_pnl: f64::NEG_INFINITY,
            min_median_window_pnl: f64::NEG_INFINITY,
            min_windows: 1,
            min_hit_rate_x2: None,
            min_hit_rate_x5: None,
            max_p90_hold_days: None,
            max_tail_contribution: None,
            min_hit_rate_x4: Some(0.10),
            min_tail_pnl_share: Some(0.30),
            min_non_tail_pnl_share: Some(-0.20),
            max_drawdown_pct: Some(-0.60),
        }
    }

    /// True when any v2 field is configured.
    pub fn is_v2(&self) -> bool {
        self.min_hit_rate_x4.is_some()
            || self.min_tail_pnl_share.is_some()
            || self.min_non_tail_pnl_share.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_detection() {
        assert!(!SelectionCriteria::rr_v1().is_v2());
        assert!(!SelectionCriteria::runner_v1().is_v2());
        assert!(SelectionCriteria::runner_v2().is_v2());
    }

    #[test]
    fn test_runner_v2_disables_v1_fields() {
        let v2 = SelectionCriteria::runner_v2();
        assert!(v2.min_hit_rate_x2.is_none());
        assert!(v2.min_hit_rate_x5.is_none());
        assert!(v2.max_p90_hold_days.is_none());
        assert!(v2.max_tail_contribution.is_none());
    }
}
