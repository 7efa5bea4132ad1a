//! Helium data credit burns, from the blockchain API's sum buckets.
//!
//! Data credits are not market priced, they are pegged at $0.00001 apiece,
//! so revenue is a straight multiplication without the price oracle. The API
//! serves day buckets for a half-open time range, capped at 30 days per
//! request. Days overwrite, the watermark day is provisional.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, date_chunks, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayWritePolicy, RevenueStorePostgres};
use crate::units::{UsdNewtype, UtcDay};
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "helium";

/// First day the original index counted burns from.
const EPOCH_DAY: &str = "2020-08-01";

const MAX_DAYS_PER_CHUNK: i64 = 30;

/// Data credits are pegged, not traded.
const USD_PER_DC: f64 = 0.00001;

const HELIUM_API: &str = "https://api.helium.io";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Serialize)]
struct DcBurnsParams {
    min_time: String,
    max_time: String,
    bucket: &'static str,
}

fn make_dc_burns_url(base_url: &str, min_day: UtcDay, max_day_exclusive: UtcDay) -> String {
    let params = DcBurnsParams {
        min_time: min_day.date_time().to_rfc3339(),
        max_time: max_day_exclusive.date_time().to_rfc3339(),
        bucket: "day",
    };

    format!(
        "{base_url}/v1/dc_burns/sum?{}",
        serde_qs::to_string(&params).expect("expect dc burns params to serialize")
    )
}

#[derive(Debug, Deserialize)]
pub struct DcBurnBucket {
    pub timestamp: DateTime<Utc>,
    /// Total data credits burned in the bucket.
    pub total: f64,
}

#[derive(Debug, Deserialize)]
struct DcBurnsResponse {
    data: Vec<DcBurnBucket>,
}

pub struct HeliumApi {
    client: reqwest::Client,
    base_url: String,
}

impl HeliumApi {
    pub fn new() -> Self {
        Self::new_with_url(HELIUM_API.to_string())
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

    /// Day buckets of burned data credits for the half-open range
    /// `[min_day, max_day_exclusive)`.
    pub async fn dc_burns(
        &self,
        min_day: UtcDay,
        max_day_exclusive: UtcDay,
    ) -> Result<Vec<DcBurnBucket>> {
        let url = make_dc_burns_url(&self.base_url, min_day, max_day_exclusive);

        debug!("sending request to {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<DcBurnsResponse>()
            .await?;

        Ok(response.data)
    }
}

impl Default for HeliumApi {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeliumImporter {
    api: HeliumApi,
}

impl HeliumImporter {
    pub fn new(api: HeliumApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Importer for HeliumImporter {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::UnixDay(
            EPOCH_DAY
                .parse()
                .expect("expect the helium epoch day to parse"),
        )
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::UnixDay(start_day) = watermark else {
            bail!("expect a unix day watermark for helium");
        };

        let mut max_seen = start_day;
        for (chunk_start, chunk_end) in date_chunks(start_day, UtcDay::today(), MAX_DAYS_PER_CHUNK)
        {
            debug!(%chunk_start, %chunk_end, "fetching dc burn chunk");

            let buckets = self.api.dc_burns(chunk_start, chunk_end.next()).await?;

            if buckets.is_empty() {
                debug!(%chunk_start, "no burn buckets reported yet, stopping");
                break;
            }

            let mut days = Vec::with_capacity(buckets.len());
            let mut chunk_max = start_day;
            for bucket in &buckets {
                let day = UtcDay::from_date_time(&bucket.timestamp);
                days.push((day, UsdNewtype(bucket.total * USD_PER_DC)));
                chunk_max = std::cmp::max(chunk_max, day);
            }
            // The API returns buckets newest first.
            days.sort_by_key(|(day, _)| *day);

            ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(chunk_max))
                .await;

            max_seen = std::cmp::max(max_seen, chunk_max);
        }

        Ok(Watermark::UnixDay(max_seen))
    }
}

pub async fn import_helium() -> Result<()> {
    log::init();

    info!("importing helium dc burns");

    let db_pool = db::get_db_pool("import-helium").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = HeliumImporter::new(HeliumApi::new());

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::projects::{MemoryProjectStore, ProjectStore};
    use crate::revenue::{MemoryRevenueStore, RevenueStore};

    use super::*;

    #[test]
    fn dc_burns_url_has_day_buckets_and_an_iso_range() {
        let min = "2020-08-01".parse::<UtcDay>().unwrap();
        let max = "2020-08-31".parse::<UtcDay>().unwrap();

        let url = make_dc_burns_url("https://api.helium.io", min, max);

        assert_eq!(
            url,
            "https://api.helium.io/v1/dc_burns/sum?\
             min_time=2020-08-01T00%3A00%3A00%2B00%3A00&\
             max_time=2020-08-31T00%3A00%3A00%2B00%3A00&\
             bucket=day"
        );
    }

    #[tokio::test]
    async fn converts_pegged_dc_burns_without_an_oracle() {
        let today = UtcDay::today();
        let start = today.plus_days(-1);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/dc_burns/sum")
            .match_query(mockito::Matcher::UrlEncoded(
                "min_time".into(),
                start.date_time().to_rfc3339(),
            ))
            .with_body(
                json!({
                    "data": [
                        { "timestamp": today.date_time().to_rfc3339(), "total": 500_000.0 },
                        { "timestamp": start.date_time().to_rfc3339(), "total": 1_000_000.0 }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        let project = projects.get_or_create(PROJECT_NAME, "1596240000").await;
        projects
            .set_watermark(PROJECT_NAME, &start.0.to_string())
            .await;

        let mut importer = HeliumImporter::new(HeliumApi::new_with_url(server.url()));
        importer::run(&projects, &revenue, &mut importer).await.unwrap();
        assert_eq!(
            revenue.day_revenue(project.id, start).await,
            Some(UsdNewtype(10.0))
        );
        assert_eq!(
            revenue.day_revenue(project.id, today).await,
            Some(UsdNewtype(5.0))
        );
        assert_eq!(
            projects.watermark(PROJECT_NAME).await,
            Some(today.0.to_string())
        );
    }
}
