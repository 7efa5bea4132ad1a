//! Akash lease spending, from the network's indexer REST API.
//!
//! Lease payments are uakt denominated events at a block height. The API
//! serves bounded block ranges, so the importer walks 1000-block windows up
//! to the chain tip and accumulates into existing days, a window can end mid
//! day. The watermark is the last fully imported block height.

use anyhow::{bail, Result};
use async_trait::async_trait;
use format_url::FormatUrl;
use serde::Deserialize;
use tracing::{debug, info};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayBuckets, DayWritePolicy, RevenueStorePostgres};
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "akash";

/// Block the original index started counting lease spending from.
const EPOCH_BLOCK: u64 = 420_400;

const MAX_BLOCKS_PER_WINDOW: u64 = 1000;

const UAKT_PER_AKT: f64 = 1e6;

const AKASH_API: &str = "https://api.akashstats.net";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    latest_block_height: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpending {
    #[allow(unused)]
    pub height: u64,
    pub timestamp: i64,
    pub uakt: f64,
}

pub struct AkashApi {
    client: reqwest::Client,
    base_url: String,
}

impl AkashApi {
    pub fn new() -> Self {
        Self::new_with_url(AKASH_API.to_string())
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

    pub async fn latest_block_height(&self) -> Result<u64> {
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/v1/status")
            .format_url();

        debug!("sending request to {}", url);

        let status = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<StatusResponse>()
            .await?;

        Ok(status.latest_block_height)
    }

    pub async fn lease_spending(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> Result<Vec<LeaseSpending>> {
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/v1/lease-spending")
            .with_query_params(vec![
                ("fromHeight", from_height.to_string().as_str()),
                ("toHeight", to_height.to_string().as_str()),
            ])
            .format_url();

        debug!("sending request to {}", url);

        let spending = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<LeaseSpending>>()
            .await?;

        Ok(spending)
    }
}

impl Default for AkashApi {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AkashImporter<A: PriceApi> {
    api: AkashApi,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> AkashImporter<A> {
    pub fn new(api: AkashApi, prices: HistoricalPriceCache<A>) -> Self {
        Self { api, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for AkashImporter<A> {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::BlockHeight(EPOCH_BLOCK)
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::BlockHeight(mut height) = watermark else {
            bail!("expect a block height watermark for akash");
        };

        let latest_height = self.api.latest_block_height().await?;

        while height < latest_height {
            let window_start = height + 1;
            let window_end = std::cmp::min(height + MAX_BLOCKS_PER_WINDOW, latest_height);

            debug!(window_start, window_end, latest_height, "fetching lease spending window");

            let spending = self.api.lease_spending(window_start, window_end).await?;

            let mut buckets = DayBuckets::new();
            for lease in &spending {
                buckets.add_at_timestamp(lease.timestamp, lease.uakt / UAKT_PER_AKT);
            }

            let days = self.prices.usd_days("AKT", &buckets).await?;
            ctx.commit_window(
                &days,
                DayWritePolicy::Accumulate,
                Watermark::BlockHeight(window_end),
            )
            .await;

            height = window_end;
        }

        Ok(Watermark::BlockHeight(height))
    }
}

pub async fn import_akash() -> Result<()> {
    log::init();

    info!("importing akash lease spending");

    let db_pool = db::get_db_pool("import-akash").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = AkashImporter::new(
        AkashApi::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use crate::coin_prices::{MockPriceApi, PriceCacheConfig};
    use crate::projects::{MemoryProjectStore, ProjectStore};
    use crate::revenue::{MemoryRevenueStore, RevenueStore};
    use crate::units::{UsdNewtype, UtcDay};

    use super::*;

    fn akt_price_api(usd: f64) -> MockPriceApi {
        let mut api = MockPriceApi::new();
        api.expect_usd_price_on()
            .withf(|symbol, _| symbol == "AKT")
            .returning(move |_, _| Ok(usd));
        api
    }

    #[tokio::test]
    async fn converts_uakt_spending_to_usd_days() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/status")
            .with_body(json!({ "latestBlockHeight": 420_402 }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/lease-spending")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("fromHeight".into(), "420401".into()),
                Matcher::UrlEncoded("toHeight".into(), "420402".into()),
            ]))
            .with_body(
                json!([
                    { "height": 420_401, "timestamp": 1_700_000_000, "uakt": 10_000_000.0 },
                    { "height": 420_402, "timestamp": 1_700_003_600, "uakt": 5_000_000.0 }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();

        let mut importer = AkashImporter::new(
            AkashApi::new_with_url(server.url()),
            HistoricalPriceCache::new_with_config(akt_price_api(2.0), PriceCacheConfig::instant()),
        );
        importer::run(&projects, &revenue, &mut importer).await.unwrap();

        let project = projects.get_or_create(PROJECT_NAME, "420400").await;
        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(1_699_920_000)).await,
            Some(UsdNewtype(30.0))
        );
        assert_eq!(
            projects.watermark(PROJECT_NAME).await,
            Some("420402".to_string())
        );
    }

    #[tokio::test]
    async fn walks_windows_up_to_the_chain_tip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/status")
            .with_body(json!({ "latestBlockHeight": 421_900 }).to_string())
            .create_async()
            .await;
        let first_window = server
            .mock("GET", "/v1/lease-spending")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("fromHeight".into(), "420401".into()),
                Matcher::UrlEncoded("toHeight".into(), "421400".into()),
            ]))
            .with_body(
                json!([{ "height": 420_500, "timestamp": 1_700_000_000, "uakt": 1_000_000.0 }])
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second_window = server
            .mock("GET", "/v1/lease-spending")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("fromHeight".into(), "421401".into()),
                Matcher::UrlEncoded("toHeight".into(), "421900".into()),
            ]))
            .with_body(
                json!([{ "height": 421_500, "timestamp": 1_700_086_400, "uakt": 2_000_000.0 }])
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();

        let mut importer = AkashImporter::new(
            AkashApi::new_with_url(server.url()),
            HistoricalPriceCache::new_with_config(akt_price_api(3.0), PriceCacheConfig::instant()),
        );
        importer::run(&projects, &revenue, &mut importer).await.unwrap();

        first_window.assert_async().await;
        second_window.assert_async().await;

        let project = projects.get_or_create(PROJECT_NAME, "420400").await;
        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(1_699_920_000)).await,
            Some(UsdNewtype(3.0))
        );
        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(1_700_006_400)).await,
            Some(UsdNewtype(6.0))
        );
        assert_eq!(
            projects.watermark(PROJECT_NAME).await,
            Some("421900".to_string())
        );
    }

    #[tokio::test]
    async fn same_day_windows_accumulate() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/status")
            .with_body(json!({ "latestBlockHeight": 422_400 }).to_string())
            .create_async()
            .await;
        // Both windows land their spending on the same day.
        server
            .mock("GET", "/v1/lease-spending")
            .match_query(Matcher::UrlEncoded("fromHeight".into(), "420401".into()))
            .with_body(
                json!([{ "height": 420_500, "timestamp": 1_700_000_000, "uakt": 1_000_000.0 }])
                    .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v1/lease-spending")
            .match_query(Matcher::UrlEncoded("fromHeight".into(), "421401".into()))
            .with_body(
                json!([{ "height": 421_500, "timestamp": 1_700_003_600, "uakt": 1_000_000.0 }])
                    .to_string(),
            )
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();

        let mut importer = AkashImporter::new(
            AkashApi::new_with_url(server.url()),
            HistoricalPriceCache::new_with_config(akt_price_api(3.0), PriceCacheConfig::instant()),
        );
        importer::run(&projects, &revenue, &mut importer).await.unwrap();

        let project = projects.get_or_create(PROJECT_NAME, "420400").await;
        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(1_699_920_000)).await,
            Some(UsdNewtype(6.0))
        );
    }
}
