//! Historical USD prices with an in-process cache and rate limiting.
//!
//! Every importer that needs prices owns one [`HistoricalPriceCache`]. The
//! cache keys on (symbol, day), never expires for the life of the one-shot
//! process, and spaces out provider requests so a fast pagination loop does
//! not burn through the provider's rate limit.

mod cryptocompare;

use std::collections::HashMap;

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::revenue::DayBuckets;
use crate::units::{UsdNewtype, UtcDay};

pub use cryptocompare::CryptoCompareApi;

/// Largest day count the provider serves in one histoday page.
const HISTO_DAY_MAX_LIMIT: usize = 2000;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price provider rate limit hit")]
    RateLimited,
    #[error("no {symbol} price on {day}")]
    NoPrice { symbol: String, day: UtcDay },
    #[error("price provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[automock]
#[async_trait]
pub trait PriceApi {
    /// Close price in USD for the given day.
    async fn usd_price_on(&self, symbol: &str, day: UtcDay) -> Result<f64, PriceError>;
    /// Daily close prices for up to `limit` days ending at `to_day`, inclusive.
    /// Days the provider has no price for are absent.
    async fn histo_day(
        &self,
        symbol: &str,
        to_day: UtcDay,
        limit: usize,
    ) -> Result<Vec<(UtcDay, f64)>, PriceError>;
}

pub struct PriceCacheConfig {
    /// Minimum spacing between provider requests.
    pub min_request_interval: Duration,
    /// Attempt ceiling for rate limited requests, first try included.
    pub max_attempts: u32,
    /// Pause after a rate limited attempt.
    pub rate_limit_delay: Duration,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            min_request_interval: Duration::from_millis(1200),
            max_attempts: 5,
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
impl PriceCacheConfig {
    /// Config without pacing delays, to keep tests fast.
    pub fn instant() -> Self {
        Self {
            min_request_interval: Duration::ZERO,
            max_attempts: 5,
            rate_limit_delay: Duration::ZERO,
        }
    }
}

pub struct HistoricalPriceCache<A: PriceApi> {
    api: A,
    config: PriceCacheConfig,
    prices: HashMap<(String, UtcDay), f64>,
    last_request: Option<Instant>,
}

impl<A: PriceApi> HistoricalPriceCache<A> {
    pub fn new(api: A) -> Self {
        Self::new_with_config(api, PriceCacheConfig::default())
    }

    pub fn new_with_config(api: A, config: PriceCacheConfig) -> Self {
        Self {
            api,
            config,
            prices: HashMap::new(),
            last_request: None,
        }
    }

    async fn pace(&mut self) {
        if let Some(last_request) = self.last_request {
            let since_last = last_request.elapsed();
            if since_last < self.config.min_request_interval {
                sleep(self.config.min_request_interval - since_last).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    pub async fn usd_price_on(
        &mut self,
        symbol: &str,
        timestamp: i64,
    ) -> Result<f64, PriceError> {
        self.usd_price_on_day(symbol, UtcDay::from_timestamp(timestamp))
            .await
    }

    pub async fn usd_price_on_day(&mut self, symbol: &str, day: UtcDay) -> Result<f64, PriceError> {
        let symbol = symbol.to_uppercase();

        if let Some(usd) = self.prices.get(&(symbol.clone(), day)) {
            return Ok(*usd);
        }

        let mut attempt = 0;
        let usd = loop {
            attempt += 1;
            self.pace().await;
            match self.api.usd_price_on(&symbol, day).await {
                Ok(usd) => break usd,
                Err(PriceError::RateLimited) if attempt < self.config.max_attempts => {
                    warn!(symbol, %day, attempt, "price request rate limited, pausing");
                    sleep(self.config.rate_limit_delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        debug!(symbol, %day, usd, "fetched price");

        self.prices.insert((symbol, day), usd);

        Ok(usd)
    }

    /// Prices for every day in the inclusive range the provider knows a price
    /// for, paging backward from the end of the range.
    pub async fn usd_prices_between(
        &mut self,
        symbol: &str,
        start_day: UtcDay,
        end_day: UtcDay,
    ) -> Result<HashMap<UtcDay, f64>, PriceError> {
        let symbol = symbol.to_uppercase();
        let mut prices = HashMap::new();
        let mut to_day = end_day;

        loop {
            let mut attempt = 0;
            let page = loop {
                attempt += 1;
                self.pace().await;
                match self
                    .api
                    .histo_day(&symbol, to_day, HISTO_DAY_MAX_LIMIT)
                    .await
                {
                    Ok(page) => break page,
                    Err(PriceError::RateLimited) if attempt < self.config.max_attempts => {
                        warn!(symbol, %to_day, attempt, "price page rate limited, pausing");
                        sleep(self.config.rate_limit_delay).await;
                    }
                    Err(err) => return Err(err),
                }
            };

            if page.is_empty() {
                break;
            }

            let earliest = page
                .iter()
                .map(|(day, _)| *day)
                .min()
                .expect("non-empty price page to have an earliest day");

            for (day, usd) in page {
                if day < start_day || day > end_day {
                    continue;
                }
                self.prices.insert((symbol.clone(), day), usd);
                prices.insert(day, usd);
            }

            debug!(symbol, %earliest, %to_day, "fetched price page");

            if earliest <= start_day {
                break;
            }

            to_day = earliest.plus_days(-1);
        }

        Ok(prices)
    }

    /// Converts native-unit day buckets into USD revenue per day.
    pub async fn usd_days(
        &mut self,
        symbol: &str,
        buckets: &DayBuckets,
    ) -> Result<Vec<(UtcDay, UsdNewtype)>, PriceError> {
        let mut days = Vec::with_capacity(buckets.len());
        for (day, amount) in buckets.iter() {
            let usd_price = self.usd_price_on_day(symbol, *day).await?;
            days.push((*day, UsdNewtype::from_native(*amount, usd_price)));
        }
        Ok(days)
    }
}
