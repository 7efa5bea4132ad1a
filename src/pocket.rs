//! Pocket relay burns, from the network explorer's daily series.
//!
//! The explorer serves the whole series from a start date in one response,
//! no paging. POKT listed late, so early days routinely have no price yet.
//! Those days are skipped with a warning and the watermark is capped to the
//! day before the first skipped one, which makes the next run pick the gap
//! up again once the price provider covers it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use format_url::FormatUrl;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi, PriceError};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayWritePolicy, RevenueStorePostgres};
use crate::units::{UsdNewtype, UtcDay};
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "pocket";

/// First day the original index counted burns from.
const EPOCH_DAY: &str = "2020-07-28";

const POCKET_API: &str = "https://api.poktscan.com";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct DailyBurn {
    pub date: String,
    /// POKT burned through relays that day.
    pub burned: f64,
}

pub struct PocketApi {
    client: reqwest::Client,
    base_url: String,
}

impl PocketApi {
    pub fn new() -> Self {
        Self::new_with_url(POCKET_API.to_string())
    }

    pub fn new_with_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("expect reqwest client to build"),
            base_url,
        }
    }

    /// The daily burn series from the given day through the present.
    pub async fn daily_burns(&self, from: UtcDay) -> Result<Vec<DailyBurn>> {
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/v1/burns/daily")
            .with_query_params(vec![("from", from.to_string().as_str())])
            .format_url();

        debug!("sending request to {}", url);

        let burns = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DailyBurn>>()
            .await?;

        Ok(burns)
    }
}

impl Default for PocketApi {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PocketImporter<A: PriceApi> {
    api: PocketApi,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> PocketImporter<A> {
    pub fn new(api: PocketApi, prices: HistoricalPriceCache<A>) -> Self {
        Self { api, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for PocketImporter<A> {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::UnixDay(
            EPOCH_DAY
                .parse()
                .expect("expect the pocket epoch day to parse"),
        )
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::UnixDay(start_day) = watermark else {
            bail!("expect a unix day watermark for pocket");
        };

        // The watermark day itself may have been incomplete last run, fetch
        // it again.
        let burns = self.api.daily_burns(start_day).await?;

        if burns.is_empty() {
            debug!(%start_day, "no burns reported yet");
            return Ok(Watermark::UnixDay(start_day));
        }

        let mut days = Vec::with_capacity(burns.len());
        let mut first_skipped: Option<UtcDay> = None;
        let mut max_seen = start_day;
        for burn in &burns {
            let day = burn.date.parse::<UtcDay>()?;
            match self.prices.usd_price_on_day("POKT", day).await {
                Ok(usd) => {
                    days.push((day, UsdNewtype::from_native(burn.burned, usd)));
                    max_seen = std::cmp::max(max_seen, day);
                }
                Err(PriceError::NoPrice { .. }) => {
                    warn!(%day, "no POKT price for day, skipping");
                    first_skipped.get_or_insert(day);
                }
                Err(err) => return Err(err.into()),
            }
        }
        days.sort_by_key(|(day, _)| *day);

        // A skipped day caps the watermark so the next run re-attempts it,
        // even when later days did import.
        let watermark_day = match first_skipped {
            Some(skipped) => skipped.plus_days(-1),
            None => max_seen,
        };
        ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(watermark_day))
            .await;

        Ok(ctx.watermark().clone())
    }
}

pub async fn import_pocket() -> Result<()> {
    log::init();

    info!("importing pocket burns");

    let db_pool = db::get_db_pool("import-pocket").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = PocketImporter::new(
        PocketApi::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}
