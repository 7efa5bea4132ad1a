//! Livepeer broadcaster fees, from the protocol subgraph.
//!
//! The subgraph already aggregates fees into day entities, with the ETH
//! volume as a decimal string and the day keyed by its unix timestamp.
//! Records are paged ascending with `date_gt`, so the stored watermark day
//! is re-fetched on every run and overwritten once it is complete.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayBuckets, DayWritePolicy, RevenueStorePostgres};
use crate::units::UtcDay;
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "livepeer";

/// First day the original index counted fees from.
const EPOCH_DAY: &str = "2021-01-01";

const LIVEPEER_SUBGRAPH: &str = "https://api.thegraph.com/subgraphs/name/livepeer/arbitrum-one";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// The Graph caps pages at 1000 entities.
const PAGE_SIZE: usize = 1000;

const DAYS_QUERY: &str = "
    query($first: Int!, $dateGt: Int!) {
        days(first: $first, orderBy: date, orderDirection: asc, where: { date_gt: $dateGt }) {
            date
            volumeETH
        }
    }
";

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<DaysData>,
}

#[derive(Debug, Deserialize)]
struct DaysData {
    days: Vec<FeeDay>,
}

#[derive(Debug, Deserialize)]
pub struct FeeDay {
    /// Unix timestamp of the day's UTC midnight.
    pub date: i64,
    #[serde(rename = "volumeETH")]
    pub volume_eth: String,
}

pub struct LivepeerSubgraph {
    client: reqwest::Client,
    url: String,
}

impl LivepeerSubgraph {
    pub fn new() -> Self {
        Self::new_with_url(LIVEPEER_SUBGRAPH.to_string())
    }

    pub fn new_with_url(url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("expect reqwest client to build"),
            url,
        }
    }

    /// One page of fee day entities strictly after the given day timestamp,
    /// oldest first.
    pub async fn fee_days(&self, date_gt: i64) -> Result<Vec<FeeDay>> {
        debug!("sending request to {}", self.url);

        let body = json!({
            "query": DAYS_QUERY,
            "variables": {
                "first": PAGE_SIZE,
                "dateGt": date_gt,
            },
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GraphQlResponse>()
            .await?;

        let data = response
            .data
            .context("expect days data in subgraph response")?;

        Ok(data.days)
    }
}

impl Default for LivepeerSubgraph {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LivepeerImporter<A: PriceApi> {
    subgraph: LivepeerSubgraph,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> LivepeerImporter<A> {
    pub fn new(subgraph: LivepeerSubgraph, prices: HistoricalPriceCache<A>) -> Self {
        Self { subgraph, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for LivepeerImporter<A> {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::UnixDay(
            EPOCH_DAY
                .parse()
                .expect("expect the livepeer epoch day to parse"),
        )
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::UnixDay(watermark_day) = watermark else {
            bail!("expect a unix day watermark for livepeer");
        };

        // The watermark day itself may have been incomplete last run, page
        // from the day before to fetch it again.
        let mut date_gt = watermark_day.plus_days(-1).0;
        let mut max_seen = watermark_day;

        loop {
            let page = self.subgraph.fee_days(date_gt).await?;

            if page.is_empty() {
                break;
            }

            let mut buckets = DayBuckets::new();
            let mut page_max = max_seen;
            for fee_day in &page {
                let day = UtcDay::from_timestamp(fee_day.date);
                let volume_eth = fee_day
                    .volume_eth
                    .parse::<f64>()
                    .with_context(|| format!("failed to parse ETH volume '{}'", fee_day.volume_eth))?;
                buckets.add(day, volume_eth);
                page_max = std::cmp::max(page_max, day);
            }

            let days = self.prices.usd_days("ETH", &buckets).await?;
            ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(page_max))
                .await;

            max_seen = page_max;

            if page.len() < PAGE_SIZE {
                break;
            }
            date_gt = page_max.0;
        }

        Ok(Watermark::UnixDay(max_seen))
    }
}

pub async fn import_livepeer() -> Result<()> {
    log::init();

    info!("importing livepeer fees");

    let db_pool = db::get_db_pool("import-livepeer").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = LivepeerImporter::new(
        LivepeerSubgraph::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}
