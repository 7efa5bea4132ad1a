//! Reconciliation mode for filecoin: instead of walking forward from the
//! watermark, diff the full upstream day series against what is stored and
//! insert only the missing days. Useful after gaps the forward importer
//! cannot heal on its own.

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use pit_wall::Progress;
use tracing::{info, warn};

use crate::coin_prices::{CryptoCompareApi, HistoricalPriceCache, PriceApi};
use crate::db;
use crate::import_lock::ImportLock;
use crate::importer::{self, ImportCtx, Importer};
use crate::log;
use crate::projects::ProjectStorePostgres;
use crate::revenue::{DayWritePolicy, RevenueStorePostgres};
use crate::units::{UsdNewtype, UtcDay};
use crate::watermarks::Watermark;

use super::{epoch_day, FilecoinApi, PROJECT_NAME};

pub struct FilecoinBackfill<A: PriceApi> {
    api: FilecoinApi,
    prices: HistoricalPriceCache<A>,
}

impl<A: PriceApi> FilecoinBackfill<A> {
    pub fn new(api: FilecoinApi, prices: HistoricalPriceCache<A>) -> Self {
        Self { api, prices }
    }
}

#[async_trait]
impl<A: PriceApi + Send + Sync> Importer for FilecoinBackfill<A> {
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
        let Watermark::UnixDay(watermark_day) = watermark else {
            bail!("expect a unix day watermark for filecoin");
        };

        let upstream = self.api.day_fees(epoch_day(), UtcDay::today()).await?;

        let stored: HashSet<UtcDay> = ctx.stored_days().await.into_iter().collect();

        let mut missing = Vec::new();
        let mut max_seen = watermark_day;
        for day_fees in &upstream {
            let day = day_fees.date.parse::<UtcDay>()?;
            max_seen = std::cmp::max(max_seen, day);
            if !stored.contains(&day) {
                missing.push((day, day_fees.fees));
            }
        }
        missing.sort_by_key(|(day, _)| *day);

        if missing.is_empty() {
            info!("no missing filecoin days, nothing to backfill");
            ctx.advance_watermark(Watermark::UnixDay(max_seen)).await;
            return Ok(Watermark::UnixDay(max_seen));
        }

        let first_missing = missing
            .first()
            .map(|(day, _)| *day)
            .expect("non-empty missing days to have a first");
        let last_missing = missing
            .last()
            .map(|(day, _)| *day)
            .expect("non-empty missing days to have a last");

        info!(
            %first_missing,
            %last_missing,
            count = missing.len(),
            "backfilling missing filecoin days"
        );

        let usd_prices = self
            .prices
            .usd_prices_between("FIL", first_missing, last_missing)
            .await?;

        let mut progress = Progress::new("backfill-filecoin", missing.len() as u64);
        let mut processed = 0u64;
        let mut days = Vec::with_capacity(missing.len());
        for (day, fil) in missing {
            match usd_prices.get(&day) {
                Some(usd_price) => {
                    days.push((day, UsdNewtype::from_native(fil, *usd_price)));
                }
                None => {
                    warn!(%day, "no FIL price for day, skipping");
                }
            }
            progress.inc_work_done();
            processed += 1;
            if processed % 100 == 0 {
                info!("{}", progress.get_progress_string());
            }
        }

        // Missing days are inserts, and the watermark covers even skipped
        // days. A later backfill finds them again through the stored-days
        // diff, not through the watermark.
        ctx.commit_window(&days, DayWritePolicy::Overwrite, Watermark::UnixDay(max_seen))
            .await;

        info!("{}", progress.get_progress_string());

        Ok(Watermark::UnixDay(max_seen))
    }
}

pub async fn backfill_filecoin() -> Result<()> {
    log::init();

    info!("backfilling filecoin fees");

    let db_pool = db::get_db_pool("backfill-filecoin").await;

    let lock = ImportLock::acquire(&db_pool, PROJECT_NAME).await?;

    let projects = ProjectStorePostgres::new(db_pool.clone());
    let revenue = RevenueStorePostgres::new(db_pool.clone());

    let mut backfill = FilecoinBackfill::new(
        FilecoinApi::new(),
        HistoricalPriceCache::new(CryptoCompareApi::new()),
    );

    importer::run(&projects, &revenue, &mut backfill).await?;

    lock.release().await?;

    Ok(())
}
