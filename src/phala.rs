//! Phala compute fees, from the network's squid indexer.
//!
//! Fee records are individual events behind an opaque record cursor, so a
//! page boundary can split a day. Days accumulate and the watermark is the
//! cursor of the last ingested record, with `"0"` meaning nothing ingested
//! yet.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

pub const PROJECT_NAME: &str = "phala";

const EPOCH_CURSOR: &str = "0";

const PHALA_SQUID: &str = "https://squid.subsquid.io/phala-fees/graphql";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// The squid caps connection pages at 1000 edges.
const PAGE_SIZE: u32 = 1000;

/// PHA has twelve decimals.
const UNITS_PER_PHA: f64 = 1e12;

const FEE_RECORDS_QUERY: &str = "
    query($first: Int!, $after: String) {
        feeRecordsConnection(orderBy: id_ASC, first: $first, after: $after) {
            pageInfo { hasNextPage endCursor }
            edges {
                node {
                    timestamp
                    fee
                }
            }
        }
    }
";

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<FeeRecordsData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeRecordsData {
    fee_records_connection: FeeRecordsConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeRecordsConnection {
    page_info: PageInfo,
    edges: Vec<FeeRecordEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: String,
}

#[derive(Debug, Deserialize)]
struct FeeRecordEdge {
    node: FeeRecord,
}

#[derive(Debug, Deserialize)]
pub struct FeeRecord {
    pub timestamp: DateTime<Utc>,
    /// Fee in base units, as a decimal string.
    pub fee: String,
}

pub struct FeeRecordsPage {
    pub has_next_page: bool,
    pub end_cursor: String,
    pub records: Vec<FeeRecord>,
}

pub struct PhalaSquid {
    client: reqwest::Client,
    url: String,
}

impl PhalaSquid {
    pub fn new() -> Self {
        Self::new_with_url(PHALA_SQUID.to_string())
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

    /// One page of fee records strictly after the given cursor, oldest first.
    pub async fn fee_records(&self, after: Option<&str>) -> Result<FeeRecordsPage> {
        debug!("sending request to {}", self.url);

        let body = json!({
            "query": FEE_RECORDS_QUERY,
            "variables": {
                "first": PAGE_SIZE,
                "after": after,
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

        let connection = response
            .data
            .context("expect fee records data in squid response")?
            .fee_records_connection;

        Ok(FeeRecordsPage {
            has_next_page: connection.page_info.has_next_page,
            end_cursor: connection.page_info.end_cursor,
            records: connection.edges.into_iter().map(|edge| edge.node).collect(),
        })
    }
}

impl Default for PhalaSquid {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PhalaImporter<A: PriceApi> {
    squid: PhalaSquid,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> PhalaImporter<A> {
    pub fn new(squid: PhalaSquid, prices: HistoricalPriceCache<A>) -> Self {
        Self { squid, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for PhalaImporter<A> {
    fn project_name(&self) -> &'static str {
        PROJECT_NAME
    }

    fn epoch(&self) -> Watermark {
        Watermark::Cursor(EPOCH_CURSOR.to_string())
    }

    async fn import(
        &mut self,
        ctx: &mut ImportCtx<'_>,
        watermark: Watermark,
    ) -> Result<Watermark> {
        let Watermark::Cursor(cursor) = watermark else {
            bail!("expect a cursor watermark for phala");
        };

        let mut final_cursor = cursor.clone();
        let mut after = if cursor == EPOCH_CURSOR {
            None
        } else {
            Some(cursor)
        };

        loop {
            let page = self.squid.fee_records(after.as_deref()).await?;

            if page.records.is_empty() {
                break;
            }

            let mut buckets = DayBuckets::new();
            for record in &page.records {
                let fee = record
                    .fee
                    .parse::<f64>()
                    .with_context(|| format!("failed to parse fee '{}'", record.fee))?;
                buckets.add(
                    UtcDay::from_date_time(&record.timestamp),
                    fee / UNITS_PER_PHA,
                );
            }

            let days = self.prices.usd_days("PHA", &buckets).await?;
            ctx.commit_window(
                &days,
                DayWritePolicy::Accumulate,
                Watermark::Cursor(page.end_cursor.clone()),
            )
            .await;

            final_cursor = page.end_cursor.clone();

            if !page.has_next_page {
                break;
            }
            after = Some(page.end_cursor);
        }

        Ok(Watermark::Cursor(final_cursor))
    }
}

pub async fn import_phala() -> Result<()> {
    log::init();

    info!("importing phala fees");

    let db_pool = db::get_db_pool("import-phala").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = PhalaImporter::new(
        PhalaSquid::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}
