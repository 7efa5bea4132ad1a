//! Filecoin network fees, from a day-bucketed analytics REST API.
//!
//! The upstream already buckets fees per UTC day and serves inclusive ISO
//! date ranges up to 31 days wide. The watermark is the last day with data;
//! that day is provisional and re-fetched on the next run, so days overwrite.

pub mod backfill;

use anyhow::{bail, Result};
use async_trait::async_trait;
use format_url::FormatUrl;
use serde::Deserialize;
use tracing::{debug, info};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, date_chunks, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayBuckets, DayWritePolicy, RevenueStorePostgres};
use crate::units::UtcDay;
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "filecoin";

/// First day the upstream reports fees for, shortly before mainnet launch.
const EPOCH_DAY: &str = "2020-10-15";

const MAX_DAYS_PER_CHUNK: i64 = 31;

const FILECOIN_API: &str = "https://api.filstats.io";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct DayFees {
    pub date: String,
    /// Total fees burned that day, FIL denominated.
    pub fees: f64,
}

pub struct FilecoinApi {
    client: reqwest::Client,
    base_url: String,
}

impl FilecoinApi {
    pub fn new() -> Self {
        Self::new_with_url(FILECOIN_API.to_string())
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

    /// Per-day fees for an inclusive ISO date range.
    pub async fn day_fees(&self, start_date: UtcDay, end_date: UtcDay) -> Result<Vec<DayFees>> {
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/fees")
            .with_query_params(vec![
                ("startDate", start_date.to_string().as_str()),
                ("endDate", end_date.to_string().as_str()),
            ])
            .format_url();

        debug!("sending request to {}", url);

        let fees = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DayFees>>()
            .await?;

        Ok(fees)
    }
}

impl Default for FilecoinApi {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_day() -> UtcDay {
    EPOCH_DAY
        .parse()
        .expect("expect the filecoin epoch day to parse")
}

pub struct FilecoinImporter<A: PriceApi> {
    api: FilecoinApi,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> FilecoinImporter<A> {
    pub fn new(api: FilecoinApi, prices: HistoricalPriceCache<A>) -> Self {
        Self { api, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for FilecoinImporter<A> {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::UnixDay(epoch_day())
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::UnixDay(start_day) = watermark else {
            bail!("expect a unix day watermark for filecoin");
        };

        // The watermark day itself may have been incomplete last run, fetch
        // it again.
        let mut max_seen = start_day;
        for (chunk_start, chunk_end) in date_chunks(start_day, UtcDay::today(), MAX_DAYS_PER_CHUNK)
        {
            debug!(%chunk_start, %chunk_end, "fetching fee chunk");

            let day_fees = self.api.day_fees(chunk_start, chunk_end).await?;

            if day_fees.is_empty() {
                debug!(%chunk_start, "no fees reported yet, stopping");
                break;
            }

            let mut buckets = DayBuckets::new();
            let mut chunk_max = start_day;
            for day_fee in &day_fees {
                let day = day_fee.date.parse::<UtcDay>()?;
                buckets.add(day, day_fee.fees);
                chunk_max = std::cmp::max(chunk_max, day);
            }

            let days = self.prices.usd_days("FIL", &buckets).await?;
            ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(chunk_max))
                .await;

            max_seen = std::cmp::max(max_seen, chunk_max);
        }

        Ok(Watermark::UnixDay(max_seen))
    }
}

pub async fn import_filecoin() -> Result<()> {
    log::init();

    info!("importing filecoin fees");

    let db_pool = db::get_db_pool("import-filecoin").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = FilecoinImporter::new(
        FilecoinApi::new(),
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
    use crate::units::UsdNewtype;

    use super::*;

    fn fil_price_api(usd: f64) -> MockPriceApi {
        let mut api = MockPriceApi::new();
        api.expect_usd_price_on()
            .withf(|symbol, _| symbol == "FIL")
            .returning(move |_, _| Ok(usd));
        api
    }

    #[tokio::test]
    async fn advances_to_the_last_reported_day_not_the_chunk_end() {
        let today = UtcDay::today();
        let start = today.plus_days(-2);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fees")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("startDate".into(), start.to_string()),
                Matcher::UrlEncoded("endDate".into(), today.to_string()),
            ]))
            .with_body(
                json!([
                    { "date": start.to_string(), "fees": 5.0 },
                    { "date": start.next().to_string(), "fees": 7.0 }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        projects.get_or_create(PROJECT_NAME, "1602720000").await;
        projects
            .set_watermark(PROJECT_NAME, &start.0.to_string())
            .await;

        let mut importer = FilecoinImporter::new(
            FilecoinApi::new_with_url(server.url()),
            HistoricalPriceCache::new_with_config(fil_price_api(2.0), PriceCacheConfig::instant()),
        );
        importer::run(&projects, &revenue, &mut importer).await.unwrap();

        let project = projects.get_or_create(PROJECT_NAME, "1602720000").await;
        assert_eq!(
            revenue.day_revenue(project.id, start).await,
            Some(UsdNewtype(10.0))
        );
        assert_eq!(
            revenue.day_revenue(project.id, start.next()).await,
            Some(UsdNewtype(14.0))
        );
        // Today had no data yet, the watermark stays on the last reported day.
        assert_eq!(
            projects.watermark(PROJECT_NAME).await,
            Some(start.next().0.to_string())
        );
    }

    #[tokio::test]
    async fn refetches_the_provisional_day_and_overwrites_it() {
        let today = UtcDay::today();
        let start = today.plus_days(-1);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fees")
            .match_query(Matcher::UrlEncoded("startDate".into(), start.to_string()))
            .with_body(
                json!([
                    { "date": start.to_string(), "fees": 5.0 },
                    { "date": today.to_string(), "fees": 3.0 }
                ])
                .to_string(),
            )
            .create_async()
            .await;
        // The second run re-fetches from the provisional day and sees a
        // higher total for it.
        server
            .mock("GET", "/fees")
            .match_query(Matcher::UrlEncoded("startDate".into(), today.to_string()))
            .with_body(json!([{ "date": today.to_string(), "fees": 9.0 }]).to_string())
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        projects.get_or_create(PROJECT_NAME, "1602720000").await;
        projects
            .set_watermark(PROJECT_NAME, &start.0.to_string())
            .await;

        let mut importer = FilecoinImporter::new(
            FilecoinApi::new_with_url(server.url()),
            HistoricalPriceCache::new_with_config(fil_price_api(1.0), PriceCacheConfig::instant()),
        );

        importer::run(&projects, &revenue, &mut importer).await.unwrap();
        let project = projects.get_or_create(PROJECT_NAME, "1602720000").await;
        assert_eq!(
            revenue.day_revenue(project.id, today).await,
            Some(UsdNewtype(3.0))
        );

        importer::run(&projects, &revenue, &mut importer).await.unwrap();
        assert_eq!(
            revenue.day_revenue(project.id, today).await,
            Some(UsdNewtype(9.0))
        );
        assert_eq!(
            revenue.day_revenue(project.id, start).await,
            Some(UsdNewtype(5.0))
        );
    }
}
