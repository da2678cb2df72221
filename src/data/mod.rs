pub mod cache;
pub mod gecko;
pub mod rate_limit;
pub mod signals;
pub mod validator;

pub use cache::*;
pub use gecko::*;
pub use rate_limit::*;
pub use signals::*;
pub use validator::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Candle;

/// Errors of the price-acquisition layer. Rate-limit exhaustion in fail mode
/// is its own variant so callers can abort the run instead of retrying.
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("rate limit exceeded fetching {url} (on_429=fail)")]
    RateLimitExceeded { url: String },

    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("no pools found for token {0}")]
    NoPools(String),

    #[error("invalid candle at {timestamp}: {detail}")]
    InvalidCandle { timestamp: String, detail: String },

    #[error("unsupported timeframe '{0}'")]
    UnsupportedTimeframe(String),

    #[error("cache file not found: {0}")]
    CacheMiss(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Serves ordered, de-duplicated candle sequences for a contract/time-range.
#[async_trait]
pub trait PriceLoader: Send + Sync {
    async fn load_prices(
        &self,
        contract_address: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, PriceError>;
}

/// Cache-only loader: reads candles from the local cache and never touches
/// the network. Used for offline reruns over a warm cache.
pub struct CsvPriceLoader {
    cache: CandleCache,
}

impl CsvPriceLoader {
    pub fn new(cache: CandleCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PriceLoader for CsvPriceLoader {
    async fn load_prices(
        &self,
        contract_address: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, PriceError> {
        let cached = self
            .cache
            .load(contract_address)?
            .ok_or_else(|| PriceError::CacheMiss(contract_address.to_string()))?;
        Ok(crate::types::slice_range(&cached.candles, start_time, end_time))
    }
}
