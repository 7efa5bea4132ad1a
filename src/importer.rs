//! Shared scaffold every protocol importer runs inside.
//!
//! The scaffold owns the project row lifecycle: load or create with the
//! protocol's epoch watermark, honor the operator's delete flag by resetting
//! to the epoch, parse the stored watermark, and hand off to the protocol's
//! own fetch loop. The protocol commits finished windows through
//! [`ImportCtx`], days first and watermark second, so a crash never leaves
//! the watermark ahead of the data.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::projects::{Project, ProjectStore};
use crate::revenue::{DayWritePolicy, RevenueStore};
use crate::units::{UsdNewtype, UtcDay};
use crate::watermarks::Watermark;

#[async_trait]
pub trait Importer {
    fn project_name(&self) -> &'static str;
    /// Where imports start when no watermark is stored yet, and the reset
    /// target for the delete flag.
    fn epoch(&self) -> Watermark;
    /// Runs the protocol's fetch loop from the given watermark, committing
    /// finished windows through `ctx`, and returns the final watermark.
    async fn import(&mut self, ctx: &mut ImportCtx<'_>, watermark: Watermark)
        -> Result<Watermark>;
}

pub struct ImportCtx<'a> {
    pub project: Project,
    projects: &'a dyn ProjectStore,
    revenue: &'a dyn RevenueStore,
    watermark: Watermark,
}

impl<'a> ImportCtx<'a> {
    pub fn new(
        project: Project,
        projects: &'a dyn ProjectStore,
        revenue: &'a dyn RevenueStore,
        watermark: Watermark,
    ) -> Self {
        Self {
            project,
            projects,
            revenue,
            watermark,
        }
    }

    /// Commits one finished upstream window: every bucketed day in
    /// chronological order under the protocol's write policy, then the
    /// watermark. Days must be sorted ascending.
    pub async fn commit_window(
        &mut self,
        days: &[(UtcDay, UsdNewtype)],
        policy: DayWritePolicy,
        watermark: Watermark,
    ) {
        for (day, revenue) in days {
            debug!(project = self.project.name, %day, %revenue, "writing day");
            match policy {
                DayWritePolicy::Overwrite => {
                    self.revenue.set_day(self.project.id, *day, *revenue).await
                }
                DayWritePolicy::Accumulate => {
                    self.revenue
                        .add_to_day(self.project.id, *day, *revenue)
                        .await
                }
            }
        }
        self.advance_watermark(watermark).await;
    }

    /// Persists the watermark if it does not move backward. A regressing
    /// watermark is a bug upstream of the commit, so it is logged and the
    /// stored one kept.
    pub async fn advance_watermark(&mut self, watermark: Watermark) {
        if watermark.regresses_from(&self.watermark) {
            warn!(
                project = self.project.name,
                stored = %self.watermark,
                proposed = %watermark,
                "watermark would move backward, keeping the stored one"
            );
            return;
        }
        self.projects
            .set_watermark(&self.project.name, &watermark.to_db_value())
            .await;
        self.watermark = watermark;
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub async fn stored_days(&self) -> Vec<UtcDay> {
        self.revenue.stored_days(self.project.id).await
    }
}

pub async fn run(
    projects: &dyn ProjectStore,
    revenue: &dyn RevenueStore,
    importer: &mut dyn Importer,
) -> Result<()> {
    let name = importer.project_name();
    let epoch = importer.epoch();

    let mut project = projects.get_or_create(name, &epoch.to_db_value()).await;

    if project.delete {
        info!(name, "delete flag set, resetting watermark to the epoch");
        project = projects.reset(name, &epoch.to_db_value()).await;
    }

    let raw_watermark = project
        .last_imported_id
        .clone()
        .unwrap_or_else(|| epoch.to_db_value());
    let watermark = epoch.kind().parse(&raw_watermark)?;

    info!(name, %watermark, "starting import");

    let mut ctx = ImportCtx::new(project, projects, revenue, watermark.clone());
    let final_watermark = importer.import(&mut ctx, watermark).await?;

    info!(name, %final_watermark, "import done");

    Ok(())
}

/// Splits an inclusive day range into provider-ceiling-sized chunks.
pub fn date_chunks(start: UtcDay, end: UtcDay, max_days: i64) -> Vec<(UtcDay, UtcDay)> {
    let mut chunks = Vec::new();
    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = std::cmp::min(chunk_start.plus_days(max_days - 1), end);
        chunks.push((chunk_start, chunk_end));
        chunk_start = chunk_end.next();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use crate::projects::MemoryProjectStore;
    use crate::revenue::MemoryRevenueStore;

    use super::*;

    struct RecordingImporter {
        epoch: Watermark,
        final_watermark: Watermark,
        received_watermark: Option<Watermark>,
    }

    impl RecordingImporter {
        fn new(epoch: Watermark, final_watermark: Watermark) -> Self {
            Self {
                epoch,
                final_watermark,
                received_watermark: None,
            }
        }
    }

    #[async_trait]
    impl Importer for RecordingImporter {
        fn project_name(&self) -> &'static str {
            "testproject"
        }

        fn epoch(&self) -> Watermark {
            self.epoch.clone()
        }

        async fn import(
            &mut self,
            ctx: &mut ImportCtx<'_>,
            watermark: Watermark,
        ) -> Result<Watermark> {
            self.received_watermark = Some(watermark);
            ctx.advance_watermark(self.final_watermark.clone()).await;
            Ok(self.final_watermark.clone())
        }
    }

    #[tokio::test]
    async fn run_creates_project_and_starts_at_epoch() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        let mut importer =
            RecordingImporter::new(Watermark::BlockHeight(100), Watermark::BlockHeight(250));

        run(&projects, &revenue, &mut importer).await.unwrap();

        assert_eq!(
            importer.received_watermark,
            Some(Watermark::BlockHeight(100))
        );
        assert_eq!(
            projects.watermark("testproject").await,
            Some("250".to_string())
        );
    }

    #[tokio::test]
    async fn run_resumes_from_stored_watermark() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        projects.get_or_create("testproject", "100").await;
        projects.set_watermark("testproject", "180").await;

        let mut importer =
            RecordingImporter::new(Watermark::BlockHeight(100), Watermark::BlockHeight(250));
        run(&projects, &revenue, &mut importer).await.unwrap();

        assert_eq!(
            importer.received_watermark,
            Some(Watermark::BlockHeight(180))
        );
    }

    #[tokio::test]
    async fn run_resets_to_epoch_when_delete_is_flagged() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        projects.get_or_create("testproject", "100").await;
        projects.set_watermark("testproject", "180").await;
        projects.set_delete("testproject", true).await;

        let mut importer =
            RecordingImporter::new(Watermark::BlockHeight(100), Watermark::BlockHeight(250));
        run(&projects, &revenue, &mut importer).await.unwrap();

        assert_eq!(
            importer.received_watermark,
            Some(Watermark::BlockHeight(100))
        );
        let project = projects.get_or_create("testproject", "100").await;
        assert!(!project.delete);
    }

    #[tokio::test]
    async fn run_fails_on_malformed_watermark() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        projects.get_or_create("testproject", "100").await;
        projects.set_watermark("testproject", "not-a-height").await;

        let mut importer =
            RecordingImporter::new(Watermark::BlockHeight(100), Watermark::BlockHeight(250));
        let result = run(&projects, &revenue, &mut importer).await;

        assert!(result.is_err());
        assert_eq!(importer.received_watermark, None);
    }

    #[tokio::test]
    async fn commit_window_writes_days_and_watermark() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        let project = projects.get_or_create("testproject", "100").await;
        let mut ctx = ImportCtx::new(
            project.clone(),
            &projects,
            &revenue,
            Watermark::BlockHeight(100),
        );

        ctx.commit_window(
            &[
                (UtcDay(0), UsdNewtype(10.0)),
                (UtcDay(86_400), UsdNewtype(5.0)),
            ],
            DayWritePolicy::Overwrite,
            Watermark::BlockHeight(200),
        )
        .await;

        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(0)).await,
            Some(UsdNewtype(10.0))
        );
        assert_eq!(
            projects.watermark("testproject").await,
            Some("200".to_string())
        );
    }

    #[tokio::test]
    async fn accumulate_policy_adds_to_existing_days() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        let project = projects.get_or_create("testproject", "100").await;
        let mut ctx = ImportCtx::new(
            project.clone(),
            &projects,
            &revenue,
            Watermark::BlockHeight(100),
        );

        let day = [(UtcDay(0), UsdNewtype(10.0))];
        ctx.commit_window(&day, DayWritePolicy::Accumulate, Watermark::BlockHeight(150))
            .await;
        ctx.commit_window(&day, DayWritePolicy::Accumulate, Watermark::BlockHeight(200))
            .await;

        assert_eq!(
            revenue.day_revenue(project.id, UtcDay(0)).await,
            Some(UsdNewtype(20.0))
        );
    }

    #[tokio::test]
    async fn watermark_never_moves_backward() {
        let projects = MemoryProjectStore::new();
        let revenue = MemoryRevenueStore::new();
        let project = projects.get_or_create("testproject", "100").await;
        let mut ctx = ImportCtx::new(project, &projects, &revenue, Watermark::BlockHeight(100));

        ctx.advance_watermark(Watermark::BlockHeight(300)).await;
        ctx.advance_watermark(Watermark::BlockHeight(250)).await;

        assert_eq!(
            projects.watermark("testproject").await,
            Some("300".to_string())
        );
    }

    #[test]
    fn date_chunks_split_at_the_ceiling() {
        let start = "2021-01-01".parse::<UtcDay>().unwrap();
        let end = start.plus_days(69);

        let chunks = date_chunks(start, end, 31);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (start, start.plus_days(30)));
        assert_eq!(chunks[1], (start.plus_days(31), start.plus_days(61)));
        assert_eq!(chunks[2], (start.plus_days(62), end));
        assert_eq!(chunks[2].0.days_until_inclusive(&chunks[2].1), 8);
    }

    #[test]
    fn date_chunks_cover_a_short_range_in_one_chunk() {
        let start = "2021-01-01".parse::<UtcDay>().unwrap();
        let end = start.plus_days(3);

        assert_eq!(date_chunks(start, end, 31), vec![(start, end)]);
    }

    #[test]
    fn date_chunks_handle_a_single_day() {
        let day = "2021-01-01".parse::<UtcDay>().unwrap();

        assert_eq!(date_chunks(day, day, 31), vec![(day, day)]);
    }

    // Importer futures hold the ctx and its store handles across await points,
    // so all three have to stay Send.
    #[test]
    fn store_handles_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ProjectStore>();
        assert_send_sync::<dyn RevenueStore>();
        assert_send_sync::<ImportCtx<'static>>();
    }
}
