use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{DataSettings, On429, RateLimitSettings};
use crate::types::{slice_range, sort_and_dedup, Candle};
use crate::utils::WarnDedup;

use super::{CachedSeries, CandleCache, CandleValidator, PriceError, PriceLoader, RateLimiter};

const DEFAULT_BASE_URL: &str = "https://api.geckoterminal.com/api/v2";
const NETWORK: &str = "solana";
const BATCH_LIMIT: usize = 1000;
/// Backstop against a pagination loop that never reaches `start_time`.
const MAX_BATCHES: usize = 400;
/// The API keeps roughly this much history.
const HISTORY_HORIZON_DAYS: i64 = 180;

#[derive(Debug, Default)]
struct LoaderMetrics {
    total_requests: u64,
    http_429: u64,
    rate_limit_failures: u64,
}

/// End-of-run instrumentation snapshot.
#[derive(Debug, Clone)]
pub struct RateLimitSummary {
    pub total_requests: u64,
    pub http_429: u64,
    pub rate_limit_failures: u64,
    pub mode_on_429: &'static str,
    pub blocked_events: u64,
    pub total_wait_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    #[serde(default)]
    data: Vec<PoolEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PoolEntry {
    pub(crate) attributes: PoolAttributes,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PoolAttributes {
    pub(crate) address: String,
    #[serde(default)]
    pub(crate) name: Option<String>,
    /// Decimal string per the wire format.
    #[serde(default)]
    pub(crate) reserve_in_usd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OhlcvResponse {
    data: OhlcvData,
}

#[derive(Debug, Deserialize)]
struct OhlcvData {
    attributes: OhlcvAttributes,
}

#[derive(Debug, Deserialize)]
struct OhlcvAttributes {
    #[serde(default)]
    ohlcv_list: Vec<Vec<serde_json::Value>>,
}

/// Rate-limited GeckoTerminal OHLCV fetcher with a dual-layout local cache.
///
/// Resolution order: probe the cache (both layouts); in cache-preferring
/// mode return the cached slice without touching the network; otherwise
/// fetch the full range backward in batches, union with cache semantics and
/// persist to the primary layout.
pub struct GeckoTerminalLoader {
    client: reqwest::Client,
    base_url: String,
    cache: CandleCache,
    timeframe: String,
    prefer_cache_if_exists: bool,
    max_cache_age_days: i64,
    max_price_jump_pct: Option<f64>,
    validator: CandleValidator,
    rate_limiter: Option<Arc<RateLimiter>>,
    on_429: On429,
    max_retries: u32,
    backoff_factor: f64,
    warn: Arc<WarnDedup>,
    metrics: Mutex<LoaderMetrics>,
}

impl GeckoTerminalLoader {
    pub fn new(
        data: &DataSettings,
        rate_limit: &RateLimitSettings,
        warn: Arc<WarnDedup>,
    ) -> Self {
        let limiter = if rate_limit.enabled {
            Some(Arc::new(RateLimiter::new(
                rate_limit.max_calls,
                rate_limit.period_seconds,
            )))
        } else {
            None
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("Mozilla/5.0 signal-backtester")
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            base_url: std::env::var("GECKO_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            cache: CandleCache::new(&data.candles_dir, &data.timeframe),
            timeframe: data.timeframe.clone(),
            prefer_cache_if_exists: data.prefer_cache_if_exists,
            max_cache_age_days: data.max_cache_age_days,
            max_price_jump_pct: data.max_price_jump_pct,
            validator: CandleValidator::new(data.strict_validation, Arc::clone(&warn)),
            rate_limiter: limiter,
            on_429: rate_limit.on_429,
            max_retries: rate_limit.max_retries.max(1),
            backoff_factor: rate_limit.backoff_factor,
            warn,
            metrics: Mutex::new(LoaderMetrics::default()),
        }
    }

    fn timeframe_endpoint(&self) -> Result<(&'static str, Option<&'static str>), PriceError> {
        match self.timeframe.as_str() {
            "1m" => Ok(("minute", None)),
            "15m" => Ok(("minute", Some("15"))),
            other => Err(PriceError::UnsupportedTimeframe(other.to_string())),
        }
    }

    /// One GET with the full retry envelope: 429 per `on_429`, 5xx and
    /// transient transport errors with exponential back-off, everything else
    /// propagated as-is.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, PriceError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            {
                let mut m = self.metrics.lock().expect("metrics lock poisoned");
                m.total_requests += 1;
            }
            debug!("GET {}", url);

            let response = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    if attempt >= self.max_retries {
                        return Err(e.into());
                    }
                    let wait = self.backoff_factor.powi(attempt as i32 - 1);
                    warn!(
                        "request failed ({}), retrying in {:.1}s (attempt {}/{})",
                        e, wait, attempt, self.max_retries
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                {
                    let mut m = self.metrics.lock().expect("metrics lock poisoned");
                    m.http_429 += 1;
                }
                if self.on_429 == On429::Fail {
                    let mut m = self.metrics.lock().expect("metrics lock poisoned");
                    m.rate_limit_failures += 1;
                    return Err(PriceError::RateLimitExceeded {
                        url: url.to_string(),
                    });
                }
                if attempt >= self.max_retries {
                    return Err(PriceError::Status {
                        status: 429,
                        url: url.to_string(),
                    });
                }
                let wait = retry_after_seconds(response.headers())
                    .unwrap_or_else(|| self.backoff_factor.powi(attempt as i32 - 1).max(2.0));
                warn!(
                    "HTTP 429, waiting {:.2}s before retry (attempt {}/{})",
                    wait, attempt, self.max_retries
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }

            if matches!(status.as_u16(), 500 | 502 | 503 | 504) {
                if attempt >= self.max_retries {
                    return Err(PriceError::Status {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                let wait = self.backoff_factor.powi(attempt as i32 - 1);
                warn!(
                    "HTTP {}, retrying in {:.1}s (attempt {}/{})",
                    status, wait, attempt, self.max_retries
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }

            if !status.is_success() {
                return Err(PriceError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            return Ok(response.json::<T>().await?);
        }
    }

    /// Resolves the pool for a token: largest `reserve_in_usd`, ties broken
    /// by declaration order, first pool when none report a reserve.
    async fn fetch_pool_id(&self, contract: &str) -> Result<String, PriceError> {
        let url = format!(
            "{}/networks/{}/tokens/{}/pools",
            self.base_url, NETWORK, contract
        );
        let response: PoolsResponse = self.get_json(&url).await?;
        let pool = select_pool(&response.data)
            .ok_or_else(|| PriceError::NoPools(contract.to_string()))?;
        let pool_id = pool.attributes.address.trim().to_string();
        info!(
            "selected pool {} ({}) reserve={}",
            pool_id,
            pool.attributes.name.as_deref().unwrap_or("unknown"),
            pool.attributes.reserve_in_usd.as_deref().unwrap_or("n/a"),
        );
        Ok(pool_id)
    }

    async fn fetch_ohlcv_batch(
        &self,
        pool_id: &str,
        before_ts: i64,
    ) -> Result<Vec<Vec<serde_json::Value>>, PriceError> {
        let (endpoint, aggregate) = self.timeframe_endpoint()?;
        let mut url = format!(
            "{}/networks/{}/pools/{}/ohlcv/{}?limit={}&before_timestamp={}",
            self.base_url, NETWORK, pool_id, endpoint, BATCH_LIMIT, before_ts
        );
        if let Some(agg) = aggregate {
            url.push_str(&format!("&aggregate={}", agg));
        }
        let response: OhlcvResponse = self.get_json(&url).await?;
        Ok(response.data.attributes.ohlcv_list)
    }

    /// Full-range fetch walking backward from `end_time` (or now) in batches
    /// of at most 1000 rows. Terminates on: empty batch, batch of only
    /// already-seen timestamps, earliest row at/before `start_time`, or the
    /// hard batch cap.
    async fn fetch_from_api(
        &self,
        contract: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, PriceError> {
        let pool_id = self.fetch_pool_id(contract).await?;

        let now = Utc::now();
        let mut before_ts = match end_time {
            Some(end) if end <= now => end.timestamp(),
            Some(_) => {
                warn!("requested end_time is in the future, clamping to now");
                now.timestamp()
            }
            None => now.timestamp(),
        };
        let horizon = (now - chrono::Duration::days(HISTORY_HORIZON_DAYS)).timestamp();
        if before_ts < horizon {
            self.warn.warn_once(
                &format!("history_horizon|{}", contract),
                &format!(
                    "requested range for {} is older than ~{} days; the API may have no data",
                    contract, HISTORY_HORIZON_DAYS
                ),
            );
        }

        let mut candles: Vec<Candle> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        for _ in 0..MAX_BATCHES {
            let rows = self.fetch_ohlcv_batch(&pool_id, before_ts).await?;
            if rows.is_empty() {
                break;
            }

            let mut batch: Vec<Candle> = Vec::with_capacity(rows.len());
            for row in &rows {
                let Some((epoch, candle)) = parse_ohlcv_row(row) else {
                    continue;
                };
                if !seen.insert(epoch) {
                    continue;
                }
                if self.validator.validate(contract, &candle)? {
                    batch.push(candle);
                }
            }

            if batch.is_empty() {
                // Non-empty response made entirely of known timestamps (or
                // rejected rows): the walk has reached the end of the data.
                debug!("batch for {} contained no new candles, stopping", contract);
                break;
            }

            let earliest = batch.last().map(|c| c.timestamp);
            candles.extend(batch);

            match earliest {
                Some(ts) => {
                    if let Some(start) = start_time {
                        if ts <= start {
                            break;
                        }
                    }
                    before_ts = ts.timestamp();
                }
                None => break,
            }
        }

        let candles = sort_and_dedup(candles);
        info!("fetched {} candles for {}", candles.len(), contract);
        self.cache.store(contract, &candles)?;
        Ok(candles)
    }

    fn warn_partial_coverage(
        &self,
        contract: &str,
        series: &CachedSeries,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) {
        let (Some(first), Some(last)) = (series.candles.first(), series.candles.last()) else {
            return;
        };
        let covers_start = start_time.map_or(true, |s| first.timestamp <= s);
        let covers_end = end_time.map_or(true, |e| last.timestamp >= e);
        if covers_start && covers_end {
            debug!("cache fully covers requested range for {}", contract);
            return;
        }
        let mut missing = Vec::new();
        if !covers_start {
            missing.push(format!(
                "start (have {}, need {})",
                first.timestamp,
                start_time.map(|t| t.to_string()).unwrap_or_default()
            ));
        }
        if !covers_end {
            missing.push(format!(
                "end (have {}, need {})",
                last.timestamp,
                end_time.map(|t| t.to_string()).unwrap_or_default()
            ));
        }
        self.warn.warn_once(
            &format!("cache_partial|{}", contract),
            &format!(
                "cache-only hit for {} covers the range only partially, missing: {}",
                contract,
                missing.join(", ")
            ),
        );
    }

    /// Post-load quality gate: cache staleness is reported (it never blocks
    /// the cache-preferring path) and the optional inter-candle jump check
    /// flags suspicious series once per contract.
    fn quality_checks(&self, contract: &str, series: &CachedSeries) {
        if let Some(age) = CandleCache::cache_age_days(series, Utc::now()) {
            if age > self.max_cache_age_days {
                debug!(
                    "cache for {} is {} days old (freshness window {} days)",
                    contract, age, self.max_cache_age_days
                );
            }
        }
        if let Some(max_jump) = self.max_price_jump_pct {
            if let Some(idx) = super::first_jump_violation(&series.candles, max_jump) {
                self.warn.warn_once(
                    &format!("price_jump|{}", contract),
                    &format!(
                        "inter-candle jump above {:.0}% for {} at {}",
                        max_jump * 100.0,
                        contract,
                        series.candles[idx].timestamp
                    ),
                );
            }
        }
    }

    pub fn rate_limit_summary(&self) -> RateLimitSummary {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let limiter_stats = self.rate_limiter.as_ref().map(|l| l.stats());
        RateLimitSummary {
            total_requests: metrics.total_requests,
            http_429: metrics.http_429,
            rate_limit_failures: metrics.rate_limit_failures,
            mode_on_429: self.on_429.as_str(),
            blocked_events: limiter_stats.map_or(0, |s| s.blocked_events),
            total_wait_seconds: limiter_stats.map_or(0.0, |s| s.total_wait_seconds),
        }
    }

    pub fn log_summary(&self) {
        let s = self.rate_limit_summary();
        if s.total_requests == 0 {
            return;
        }
        info!(
            "rate limit summary: total_requests={} http_429={} rate_limit_failures={} \
             mode_on_429={} blocked_events={} total_wait_seconds={:.2}",
            s.total_requests,
            s.http_429,
            s.rate_limit_failures,
            s.mode_on_429,
            s.blocked_events,
            s.total_wait_seconds
        );
    }
}

#[async_trait]
impl PriceLoader for GeckoTerminalLoader {
    async fn load_prices(
        &self,
        contract_address: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, PriceError> {
        let cached = self.cache.load(contract_address)?;

        if let Some(series) = &cached {
            if !series.candles.is_empty() {
                let first = series.candles.first().map(|c| c.timestamp);
                let last = series.candles.last().map(|c| c.timestamp);
                self.quality_checks(contract_address, series);

                if self.prefer_cache_if_exists {
                    // Cache-only mode: return the intersection even when the
                    // coverage is partial, warn, never call the network.
                    self.warn_partial_coverage(contract_address, series, start_time, end_time);
                    self.cache.migrate_legacy(contract_address, series);
                    return Ok(slice_range(&series.candles, start_time, end_time));
                }

                let covers_start = start_time.map_or(true, |s| first.map_or(false, |f| f <= s));
                let covers_end = end_time.map_or(true, |e| last.map_or(false, |l| l >= e));
                if covers_start && covers_end {
                    self.cache.migrate_legacy(contract_address, series);
                    return Ok(slice_range(&series.candles, start_time, end_time));
                }
                info!(
                    "cache for {} does not cover the requested range, reloading from API",
                    contract_address
                );
            }
        } else {
            debug!("cache miss for {}", contract_address);
        }

        match self.fetch_from_api(contract_address, start_time, end_time).await {
            Ok(candles) => Ok(slice_range(&candles, start_time, end_time)),
            // Fail-fast rate limiting and strict-validation failures abort
            // the load instead of degrading to the cache.
            Err(e @ PriceError::RateLimitExceeded { .. }) => Err(e),
            Err(e @ PriceError::InvalidCandle { .. }) => Err(e),
            Err(e) => {
                warn!("API fetch failed for {}: {}", contract_address, e);
                if let Some(series) = cached {
                    warn!("falling back to cached candles for {}", contract_address);
                    Ok(slice_range(&series.candles, start_time, end_time))
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }
}

/// Largest-reserve pool; ties keep the earlier declaration; first pool when
/// no reserve is reported at all.
pub(crate) fn select_pool(pools: &[PoolEntry]) -> Option<&PoolEntry> {
    if pools.is_empty() {
        return None;
    }
    let mut best: Option<(&PoolEntry, f64)> = None;
    for pool in pools {
        let Some(reserve) = pool
            .attributes
            .reserve_in_usd
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok())
        else {
            continue;
        };
        match best {
            Some((_, max)) if reserve <= max => {}
            _ => best = Some((pool, reserve)),
        }
    }
    best.map(|(p, _)| p).or_else(|| pools.first())
}

/// Wire row: `[epoch_seconds, open, high, low, close, volume]`.
pub(crate) fn parse_ohlcv_row(row: &[serde_json::Value]) -> Option<(i64, Candle)> {
    if row.len() < 6 {
        return None;
    }
    let epoch = row[0].as_i64()?;
    let timestamp = Utc.timestamp_opt(epoch, 0).single()?;
    let field = |i: usize| -> Option<Decimal> {
        let v = &row[i];
        if let Some(f) = v.as_f64() {
            Decimal::try_from(f).ok()
        } else {
            v.as_str().and_then(|s| s.parse::<Decimal>().ok())
        }
    };
    Some((
        epoch,
        Candle {
            timestamp,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
        },
    ))
}

fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pool(address: &str, reserve: Option<&str>) -> PoolEntry {
        PoolEntry {
            attributes: PoolAttributes {
                address: address.to_string(),
                name: None,
                reserve_in_usd: reserve.map(str::to_string),
            },
        }
    }

    #[test]
    fn test_select_pool_prefers_largest_reserve() {
        let pools = vec![
            pool("small", Some("1000.5")),
            pool("big", Some("90000")),
            pool("mid", Some("5000")),
        ];
        assert_eq!(select_pool(&pools).unwrap().attributes.address, "big");
    }

    #[test]
    fn test_select_pool_tie_keeps_declaration_order() {
        let pools = vec![pool("first", Some("100")), pool("second", Some("100"))];
        assert_eq!(select_pool(&pools).unwrap().attributes.address, "first");
    }

    #[test]
    fn test_select_pool_falls_back_to_first_without_reserves() {
        let pools = vec![pool("a", None), pool("b", Some("garbage"))];
        assert_eq!(select_pool(&pools).unwrap().attributes.address, "a");
    }

    #[test]
    fn test_select_pool_empty_is_none() {
        assert!(select_pool(&[]).is_none());
    }

    #[test]
    fn test_parse_ohlcv_row_numbers() {
        let row = vec![
            serde_json::json!(1_704_110_400),
            serde_json::json!(1.5),
            serde_json::json!(2.0),
            serde_json::json!(1.0),
            serde_json::json!(1.8),
            serde_json::json!(12345.0),
        ];
        let (epoch, candle) = parse_ohlcv_row(&row).unwrap();
        assert_eq!(epoch, 1_704_110_400);
        assert_eq!(candle.open, dec!(1.5));
        assert_eq!(candle.close, dec!(1.8));
        assert_eq!(candle.volume, dec!(12345.0));
    }

    #[test]
    fn test_parse_ohlcv_row_short_row_is_none() {
        let row = vec![serde_json::json!(1), serde_json::json!(2)];
        assert!(parse_ohlcv_row(&row).is_none());
    }

    #[test]
    fn test_retry_after_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7.5".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), Some(7.5));
        headers.insert(reqwest::header::RETRY_AFTER, "bogus".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), None);
    }
}
