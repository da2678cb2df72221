use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{sort_and_dedup, Candle};

use super::PriceError;

/// Candle CSV row as persisted on disk, header-first:
/// timestamp,open,high,low,close,volume.
#[derive(Debug, Serialize, Deserialize)]
struct CandleRow {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// A cache hit, remembering which layout served it.
#[derive(Debug)]
pub struct CachedSeries {
    pub candles: Vec<Candle>,
    pub from_legacy_layout: bool,
    pub path: PathBuf,
}

/// On-disk candle cache supporting two layouts:
///   (a) `<root>/<timeframe>/<contract>.csv`   — primary, all writes go here
///   (b) `<root>/<contract>_<timeframe>.csv`   — legacy, read-only
///
/// A legacy hit is migrated opportunistically by rewriting into layout (a).
#[derive(Debug, Clone)]
pub struct CandleCache {
    root: PathBuf,
    timeframe: String,
}

impl CandleCache {
    pub fn new(root: impl AsRef<Path>, timeframe: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timeframe: timeframe.to_string(),
        }
    }

    pub fn primary_path(&self, contract: &str) -> PathBuf {
        self.root
            .join(&self.timeframe)
            .join(format!("{}.csv", contract))
    }

    pub fn legacy_path(&self, contract: &str) -> PathBuf {
        self.root.join(format!("{}_{}.csv", contract, self.timeframe))
    }

    /// Probes both layouts, primary first, and loads the first that exists.
    pub fn load(&self, contract: &str) -> Result<Option<CachedSeries>, PriceError> {
        for (path, legacy) in [
            (self.primary_path(contract), false),
            (self.legacy_path(contract), true),
        ] {
            if !path.exists() {
                continue;
            }
            match self.read_file(&path) {
                Ok(candles) => {
                    debug!(
                        "cache hit for {} ({} candles, layout={})",
                        contract,
                        candles.len(),
                        if legacy { "legacy" } else { "primary" }
                    );
                    return Ok(Some(CachedSeries {
                        candles,
                        from_legacy_layout: legacy,
                        path,
                    }));
                }
                Err(e) => {
                    warn!("failed to read cache {}: {}", path.display(), e);
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Candle>, PriceError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut candles = Vec::new();
        for row in reader.deserialize::<CandleRow>() {
            let row = row?;
            candles.push(Candle {
                timestamp: row.timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok(sort_and_dedup(candles))
    }

    /// Writes candles to the primary layout, creating directories as needed.
    pub fn store(&self, contract: &str, candles: &[Candle]) -> Result<PathBuf, PriceError> {
        let path = self.primary_path(contract);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&path)?;
        for c in candles {
            writer.serialize(CandleRow {
                timestamp: c.timestamp,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })?;
        }
        writer.flush()?;
        info!("saved {} candles to cache: {}", candles.len(), path.display());
        Ok(path)
    }

    /// Rewrites a legacy-layout hit into the primary layout, once.
    pub fn migrate_legacy(&self, contract: &str, series: &CachedSeries) {
        if !series.from_legacy_layout {
            return;
        }
        let target = self.primary_path(contract);
        if target.exists() {
            return;
        }
        info!(
            "migrating cache from legacy layout: {} -> {}",
            series.path.display(),
            target.display()
        );
        if let Err(e) = self.store(contract, &series.candles) {
            warn!("legacy cache migration failed for {}: {}", contract, e);
        }
    }

    /// Age of the newest cached candle in days; None when empty.
    pub fn cache_age_days(series: &CachedSeries, now: DateTime<Utc>) -> Option<i64> {
        series
            .candles
            .last()
            .map(|c| (now - c.timestamp).num_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_candles() -> Vec<Candle> {
        (0..3)
            .map(|i| Candle {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, i, 0).unwrap(),
                open: dec!(1.0),
                high: dec!(1.5),
                low: dec!(0.9),
                close: dec!(1.2),
                volume: dec!(100),
            })
            .collect()
    }

    #[test]
    fn test_store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "1m");
        let candles = sample_candles();
        cache.store("TOKEN1", &candles).unwrap();

        let loaded = cache.load("TOKEN1").unwrap().unwrap();
        assert!(!loaded.from_legacy_layout);
        assert_eq!(loaded.candles, candles);

        // Writing back and reloading yields identical rows.
        cache.store("TOKEN1", &loaded.candles).unwrap();
        let reloaded = cache.load("TOKEN1").unwrap().unwrap();
        assert_eq!(reloaded.candles, candles);
    }

    #[test]
    fn test_legacy_layout_is_read_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "1m");
        let candles = sample_candles();

        // Plant a legacy-layout file by hand.
        let legacy = cache.legacy_path("TOKEN2");
        let mut writer = csv::Writer::from_path(&legacy).unwrap();
        for c in &candles {
            writer
                .serialize(CandleRow {
                    timestamp: c.timestamp,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
                .unwrap();
        }
        writer.flush().unwrap();

        let series = cache.load("TOKEN2").unwrap().unwrap();
        assert!(series.from_legacy_layout);
        assert_eq!(series.candles, candles);

        cache.migrate_legacy("TOKEN2", &series);
        assert!(cache.primary_path("TOKEN2").exists());

        // Primary layout wins on the next probe.
        let series = cache.load("TOKEN2").unwrap().unwrap();
        assert!(!series.from_legacy_layout);
    }

    #[test]
    fn test_missing_contract_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "1m");
        assert!(cache.load("NOPE").unwrap().is_none());
    }

    #[test]
    fn test_load_dedups_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "1m");
        let mut candles = sample_candles();
        let mut dup = candles[0].clone();
        dup.close = dec!(9.9);
        candles.push(dup);
        cache.store("TOKEN3", &candles).unwrap();

        let loaded = cache.load("TOKEN3").unwrap().unwrap();
        assert_eq!(loaded.candles.len(), 3);
        // First-seen wins.
        assert_eq!(loaded.candles[0].close, dec!(1.2));
    }
}
