use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::info;

use crate::types::Signal;

const REQUIRED_COLUMNS: [&str; 3] = ["id", "contract_address", "timestamp"];

/// Flexible-schema signal CSV loader.
///
/// Required columns: id, contract_address, timestamp (UTC). Optional:
/// source (default "unknown"), narrative (default ""), extra_json (JSON
/// object). Any other column becomes a key in `extra`; column values beat
/// extra_json entries on key collision. Empty/NaN cells are dropped.
pub struct CsvSignalLoader {
    path: PathBuf,
}

impl CsvSignalLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_signals(&self) -> Result<Vec<Signal>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("cannot open signals CSV {}", self.path.display()))?;

        let headers: Vec<String> = reader
            .headers()
            .context("signals CSV has no header row")?
            .iter()
            .map(str::to_string)
            .collect();
        for required in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == required) {
                bail!(
                    "signals CSV {} is missing required column '{}'",
                    self.path.display(),
                    required
                );
            }
        }

        let mut signals = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |name: &str| -> Option<&str> {
                headers
                    .iter()
                    .position(|h| h == name)
                    .and_then(|i| record.get(i))
                    .map(str::trim)
                    .filter(|v| !is_missing(v))
            };

            let id = match cell("id") {
                Some(v) => v.to_string(),
                None => bail!("signals CSV row {}: empty 'id'", line + 2),
            };
            let contract = match cell("contract_address") {
                Some(v) => v.to_string(),
                None => bail!("signals CSV row {}: empty 'contract_address'", line + 2),
            };
            let ts_raw = match cell("timestamp") {
                Some(v) => v,
                None => bail!("signals CSV row {}: empty 'timestamp'", line + 2),
            };
            let timestamp = parse_timestamp(ts_raw)
                .with_context(|| format!("signals CSV row {}: bad timestamp '{}'", line + 2, ts_raw))?;

            let mut extra: HashMap<String, serde_json::Value> = HashMap::new();
            if let Some(raw_json) = cell("extra_json") {
                if let Ok(serde_json::Value::Object(map)) =
                    serde_json::from_str::<serde_json::Value>(raw_json)
                {
                    extra.extend(map);
                }
            }
            // Free columns override extra_json on collision.
            for (i, header) in headers.iter().enumerate() {
                if matches!(
                    header.as_str(),
                    "id" | "contract_address" | "timestamp" | "source" | "narrative" | "extra_json"
                ) {
                    continue;
                }
                if let Some(value) = record.get(i).map(str::trim).filter(|v| !is_missing(v)) {
                    extra.insert(header.clone(), serde_json::json!(value));
                }
            }

            signals.push(Signal {
                id,
                contract_address: contract,
                timestamp,
                source: cell("source").unwrap_or("unknown").to_string(),
                narrative: cell("narrative").unwrap_or("").to_string(),
                extra,
            });
        }

        info!("loaded {} signals from {}", signals.len(), self.path.display());
        Ok(signals)
    }
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("null")
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    // Naive timestamps are treated as UTC.
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    bail!("unrecognized timestamp format: {}", raw)
}
