//! Arweave storage fees, from the public gateway's GraphQL API.
//!
//! Transactions come in ascending block order through a cursor-paginated
//! connection, windowed 1000 blocks at a time. Fees are winston denominated
//! and a page boundary can split a calendar day, so days accumulate rather
//! than overwrite. The watermark is the last fully imported block height.

mod gateway;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayBuckets, DayWritePolicy, RevenueStorePostgres};
use crate::watermarks::Watermark;

pub use gateway::ArweaveGateway;

pub const PROJECT_NAME: &str = "arweave";

/// Block the original index started counting fees from.
const EPOCH_BLOCK: u64 = 607_360;

const MAX_BLOCKS_PER_WINDOW: u64 = 1000;

const WINSTON_PER_AR: f64 = 1e12;

pub struct ArweaveImporter<A: PriceApi> {
    gateway: ArweaveGateway,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> ArweaveImporter<A> {
    pub fn new(gateway: ArweaveGateway, prices: HistoricalPriceCache<A>) -> Self {
        Self { gateway, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for ArweaveImporter<A> {
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
            bail!("expect a block height watermark for arweave");
        };

        let current_height = self.gateway.current_height().await?;

        while height < current_height {
            let window_start = height + 1;
            let window_end = std::cmp::min(height + MAX_BLOCKS_PER_WINDOW, current_height);

            debug!(window_start, window_end, current_height, "fetching fee window");

            let mut buckets = DayBuckets::new();
            let mut after: Option<String> = None;

            loop {
                let page = self
                    .gateway
                    .fee_transactions(window_start, window_end, after.as_deref())
                    .await?;

                for edge in &page.edges {
                    let ar = edge
                        .node
                        .fee
                        .winston
                        .parse::<f64>()
                        .with_context(|| {
                            format!("expect a numeric winston fee, got {}", edge.node.fee.winston)
                        })?
                        / WINSTON_PER_AR;
                    buckets.add_at_timestamp(edge.node.block.timestamp, ar);
                }

                if !page.has_next_page || page.edges.is_empty() {
                    break;
                }
                after = page.edges.last().map(|edge| edge.cursor.clone());
            }

            let days = self.prices.usd_days("AR", &buckets).await?;
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

pub async fn import_arweave() -> Result<()> {
    log::init();

    info!("importing arweave fees");

    let db_pool = db::get_db_pool("import-arweave").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut importer = ArweaveImporter::new(
        ArweaveGateway::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut importer).await?;

    lock.release().await?;

    Ok(())
}
