use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use mockall::automock;
use sqlx::{PgPool, Postgres};

use crate::units::{UsdNewtype, UtcDay};

#[automock]
#[async_trait]
pub trait RevenueStore: Send + Sync {
    async fn day_revenue(&self, project_id: i32, day: UtcDay) -> Option<UsdNewtype>;
    /// Overwrites the day's revenue, creating the row when absent.
    async fn set_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype);
    /// Adds to the day's revenue, creating the row when absent.
    async fn add_to_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype);
    /// All stored days for a project, ascending. The backfill diffs upstream series against this.
    async fn stored_days(&self, project_id: i32) -> Vec<UtcDay>;
}

pub struct RevenueStorePostgres {
    db_pool: PgPool,
}

impl RevenueStorePostgres {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    // Find-then-write rather than ON CONFLICT. The import lock guarantees a single writer per
    // project, so the read-modify-write cannot race.
    async fn write_day(&self, project_id: i32, day: UtcDay, revenue: f64) {
        let exists = sqlx::query_scalar::<Postgres, f64>(
            "
            SELECT revenue
            FROM days
            WHERE project_id = $1 AND date = $2
            ",
        )
        .bind(project_id)
        .bind(day)
        .fetch_optional(&self.db_pool)
        .await
        .unwrap()
        .is_some();

        if exists {
            sqlx::query(
                "
                UPDATE days
                SET revenue = $3
                WHERE project_id = $1 AND date = $2
                ",
            )
            .bind(project_id)
            .bind(day)
            .bind(revenue)
            .execute(&self.db_pool)
            .await
            .unwrap();
        } else {
            sqlx::query(
                "
                INSERT INTO days (project_id, date, revenue)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(project_id)
            .bind(day)
            .bind(revenue)
            .execute(&self.db_pool)
            .await
            .unwrap();
        }
    }
}

#[async_trait]
impl RevenueStore for RevenueStorePostgres {
    async fn day_revenue(&self, project_id: i32, day: UtcDay) -> Option<UsdNewtype> {
        sqlx::query_scalar::<Postgres, f64>(
            "
            SELECT revenue
            FROM days
            WHERE project_id = $1 AND date = $2
            ",
        )
        .bind(project_id)
        .bind(day)
        .fetch_optional(&self.db_pool)
        .await
        .unwrap()
        .map(UsdNewtype)
    }

    async fn set_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype) {
        self.write_day(project_id, day, revenue.0).await;
    }

    async fn add_to_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype) {
        let existing = self
            .day_revenue(project_id, day)
            .await
            .unwrap_or(UsdNewtype::ZERO);
        self.write_day(project_id, day, (existing + revenue).0).await;
    }

    async fn stored_days(&self, project_id: i32) -> Vec<UtcDay> {
        sqlx::query_scalar::<Postgres, UtcDay>(
            "
            SELECT date
            FROM days
            WHERE project_id = $1
            ORDER BY date ASC
            ",
        )
        .bind(project_id)
        .fetch_all(&self.db_pool)
        .await
        .unwrap()
    }
}

/// In-memory store for importer tests that don't want a database.
pub struct MemoryRevenueStore {
    days: Mutex<HashMap<i32, BTreeMap<UtcDay, f64>>>,
}

impl MemoryRevenueStore {
    pub fn new() -> Self {
        Self {
            days: Mutex::new(HashMap::new()),
        }
    }

    /// Everything stored for a project, for equality assertions in tests.
    pub fn snapshot(&self, project_id: i32) -> BTreeMap<UtcDay, f64> {
        self.days
            .lock()
            .unwrap()
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryRevenueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevenueStore for MemoryRevenueStore {
    async fn day_revenue(&self, project_id: i32, day: UtcDay) -> Option<UsdNewtype> {
        self.days
            .lock()
            .unwrap()
            .get(&project_id)
            .and_then(|days| days.get(&day))
            .copied()
            .map(UsdNewtype)
    }

    async fn set_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype) {
        self.days
            .lock()
            .unwrap()
            .entry(project_id)
            .or_default()
            .insert(day, revenue.0);
    }

    async fn add_to_day(&self, project_id: i32, day: UtcDay, revenue: UsdNewtype) {
        *self
            .days
            .lock()
            .unwrap()
            .entry(project_id)
            .or_default()
            .entry(day)
            .or_insert(0.0) += revenue.0;
    }

    async fn stored_days(&self, project_id: i32) -> Vec<UtcDay> {
        self.days
            .lock()
            .unwrap()
            .get(&project_id)
            .map(|days| days.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use test_context::test_context;

    use crate::db::tests::TestDb;
    use crate::projects::{ProjectStore, ProjectStorePostgres};

    use super::*;

    #[tokio::test]
    async fn set_day_overwrites() {
        let store = MemoryRevenueStore::new();

        store.set_day(1, UtcDay(0), UsdNewtype(10.0)).await;
        store.set_day(1, UtcDay(0), UsdNewtype(12.5)).await;

        assert_eq!(store.day_revenue(1, UtcDay(0)).await, Some(UsdNewtype(12.5)));
    }

    #[tokio::test]
    async fn add_to_day_accumulates() {
        let store = MemoryRevenueStore::new();

        store.add_to_day(1, UtcDay(0), UsdNewtype(10.0)).await;
        store.add_to_day(1, UtcDay(0), UsdNewtype(2.5)).await;

        assert_eq!(store.day_revenue(1, UtcDay(0)).await, Some(UsdNewtype(12.5)));
    }

    #[tokio::test]
    async fn stored_days_are_ascending_and_per_project() {
        let store = MemoryRevenueStore::new();

        store.set_day(1, UtcDay(86_400), UsdNewtype(1.0)).await;
        store.set_day(1, UtcDay(0), UsdNewtype(1.0)).await;
        store.set_day(2, UtcDay(172_800), UsdNewtype(1.0)).await;

        assert_eq!(store.stored_days(1).await, vec![UtcDay(0), UtcDay(86_400)]);
        assert_eq!(store.stored_days(2).await, vec![UtcDay(172_800)]);
    }

    #[test_context(TestDb)]
    #[tokio::test]
    #[ignore = "needs a live testdb database"]
    async fn day_roundtrip_test(test_db: &TestDb) {
        let projects = ProjectStorePostgres::new(test_db.pool.clone());
        let store = RevenueStorePostgres::new(test_db.pool.clone());

        let project = projects.get_or_create("arweave", "607360").await;

        store.set_day(project.id, UtcDay(0), UsdNewtype(10.0)).await;
        store.set_day(project.id, UtcDay(0), UsdNewtype(12.5)).await;
        assert_eq!(
            store.day_revenue(project.id, UtcDay(0)).await,
            Some(UsdNewtype(12.5))
        );

        store
            .add_to_day(project.id, UtcDay(86_400), UsdNewtype(1.5))
            .await;
        store
            .add_to_day(project.id, UtcDay(86_400), UsdNewtype(1.5))
            .await;
        assert_eq!(
            store.day_revenue(project.id, UtcDay(86_400)).await,
            Some(UsdNewtype(3.0))
        );

        assert_eq!(
            store.stored_days(project.id).await,
            vec![UtcDay(0), UtcDay(86_400)]
        );
    }
}
