//! Wailinoo streaming revenue, from their partner reporting API.
//!
//! The API is the easy one of the family: authenticated with a bearer token,
//! day buckets already in USD, inclusive ISO date ranges up to 31 days wide.
//! Days overwrite and the watermark day is provisional, like filecoin.

use anyhow::{bail, Result};
use async_trait::async_trait;
use format_url::FormatUrl;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db;
use crate::env::ENV_CONFIG;
use crate::import_lock::ImportLock;
use crate::importer::{self, date_chunks, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayWritePolicy, RevenueStorePostgres};
use crate::units::{UsdNewtype, UtcDay};
use crate::watermarks::Watermark;

pub const PROJECT_NAME: &str = "wailinoo";

/// First day the partner API reports revenue for.
const EPOCH_DAY: &str = "2021-06-01";

const MAX_DAYS_PER_CHUNK: i64 = 31;

const WAILINOO_API: &str = "https://api.wailinoo.com";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct RevenueDay {
    pub date: String,
    /// Revenue for the day, already in USD.
    pub usd: f64,
}

pub struct WailinooApi {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl WailinooApi {
    pub fn new() -> Self {
        let api_token = ENV_CONFIG
            .wailinoo_api_token
            .clone()
            .expect("WAILINOO_API_TOKEN is required to import wailinoo");
        Self::new_with_url(WAILINOO_API.to_string(), api_token)
    }

    pub fn new_with_url(base_url: String, api_token: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("expect reqwest client to build"),
            base_url,
            api_token,
        }
    }

    /// Per-day USD revenue for an inclusive ISO date range.
    pub async fn revenue_days(
        &self,
        start_date: UtcDay,
        end_date: UtcDay,
    ) -> Result<Vec<RevenueDay>> {
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/v1/revenue/daily")
            .with_query_params(vec![
                ("start_date", start_date.to_string().as_str()),
                ("end_date", end_date.to_string().as_str()),
            ])
            .format_url();

        debug!("sending request to {}", url);

        let days = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<RevenueDay>>()
            .await?;

        Ok(days)
    }
}

pub struct WailinooImporter {
    api: WailinooApi,
}

impl WailinooImporter {
    pub fn new(api: WailinooApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Importer for WailinooImporter {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::UnixDay(
            EPOCH_DAY
                .parse()
                .expect("expect the wailinoo epoch day to parse"),
        )
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::UnixDay(start_day) = watermark else {
            bail!("expect a unix day watermark for wailinoo");
        };

        // The watermark day itself may have been incomplete last run, fetch
        // it again.
        let mut max_seen = start_day;
        for (chunk_start, chunk_end) in date_chunks(start_day, UtcDay::today(), MAX_DAYS_PER_CHUNK)
        {
            debug!(%chunk_start, %chunk_end, "fetching revenue chunk");

            let revenue_days = self.api.revenue_days(chunk_start, chunk_end).await?;

            if revenue_days.is_empty() {
                debug!(%chunk_start, "no revenue reported yet, stopping");
                break;
            }

            let mut days = Vec::with_capacity(revenue_days.len());
            let mut chunk_max = start_day;
            for revenue_day in &revenue_days {
                let day = revenue_day.date.parse::<UtcDay>()?;
                days.push((day, UsdNewtype(revenue_day.usd)));
                chunk_max = std::cmp::max(chunk_max, day);
            }
            days.sort_by_key(|(day, _)| *day);

            ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(chunk_max))
                .await;

            max_seen = std::cmp::max(max_seen, chunk_max);
        }

        Ok(Watermark::UnixDay(max_seen))
    }
}

pub async fn import_wailinoo() -> Result<()> {
    log::init();

    info!("importing wailinoo revenue");

    let db_pool = db::get_db_pool("import-wailinoo").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = WailinooImporter::new(WailinooApi::new());

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}
