use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::Candle;

/// Feature windows in minutes before entry.
pub const FEATURE_WINDOWS_MIN: [i64; 3] = [5, 15, 60];

/// Volume/volatility features over windows strictly before `entry_time`.
/// Nothing at or after the entry candle leaks in.
///
/// Keys per window w: `vol_sum_{w}m`, `range_pct_{w}m`, `volat_{w}m`.
pub fn window_features(
    candles: &[Candle],
    entry_time: DateTime<Utc>,
    entry_price: Decimal,
) -> HashMap<String, serde_json::Value> {
    let mut features = HashMap::new();

    let mut before: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.timestamp < entry_time)
        .collect();
    before.sort_by_key(|c| c.timestamp);

    for w in FEATURE_WINDOWS_MIN {
        let window_start = entry_time - Duration::minutes(w);
        let window: Vec<&&Candle> = before
            .iter()
            .filter(|c| c.timestamp >= window_start)
            .collect();

        if window.is_empty() {
            features.insert(format!("vol_sum_{}m", w), serde_json::json!(0.0));
            features.insert(format!("range_pct_{}m", w), serde_json::json!(0.0));
            features.insert(format!("volat_{}m", w), serde_json::json!(0.0));
            continue;
        }

        let vol_sum: Decimal = window.iter().map(|c| c.volume).sum();
        features.insert(
            format!("vol_sum_{}m", w),
            serde_json::json!(vol_sum.to_f64().unwrap_or(0.0)),
        );

        let max_high = window.iter().map(|c| c.high).max().unwrap_or(Decimal::ZERO);
        let min_low = window.iter().map(|c| c.low).min().unwrap_or(Decimal::ZERO);
        let range_pct = if entry_price > Decimal::ZERO {
            ((max_high - min_low) / entry_price).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        features.insert(format!("range_pct_{}m", w), serde_json::json!(range_pct));

        features.insert(
            format!("volat_{}m", w),
            serde_json::json!(returns_stdev(&window)),
        );
    }

    features
}

/// Sample standard deviation of close-to-close returns; 0 below 2 returns.
fn returns_stdev(window: &[&&Candle]) -> f64 {
    let mut returns = Vec::new();
    for pair in window.windows(2) {
        let prev = pair[0].close;
        let curr = pair[1].close;
        if prev > Decimal::ZERO {
            if let Some(r) = ((curr - prev) / prev).to_f64() {
                returns.push(r);
            }
        }
    }
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Market-cap proxy features: `entry_mcap_proxy`, `exit_mcap_proxy`,
/// `mcap_change_pct`, `total_supply_used`.
pub fn mcap_features(
    entry_price: Option<Decimal>,
    exit_price: Option<Decimal>,
    total_supply: Decimal,
) -> HashMap<String, serde_json::Value> {
    let mut features = HashMap::new();
    features.insert(
        "total_supply_used".to_string(),
        serde_json::json!(total_supply.to_f64().unwrap_or(0.0)),
    );

    let Some(entry) = entry_price else {
        return features;
    };
    let entry_mcap = entry * total_supply;
    features.insert(
        "entry_mcap_proxy".to_string(),
        serde_json::json!(entry_mcap.to_f64().unwrap_or(0.0)),
    );

    if let Some(exit) = exit_price {
        let exit_mcap = exit * total_supply;
        features.insert(
            "exit_mcap_proxy".to_string(),
            serde_json::json!(exit_mcap.to_f64().unwrap_or(0.0)),
        );
        let change = if entry_mcap > Decimal::ZERO {
            ((exit_mcap - entry_mcap) / entry_mcap).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        features.insert("mcap_change_pct".to_string(), serde_json::json!(change));
    }

    features
}
