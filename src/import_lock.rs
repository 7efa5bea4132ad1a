//! Single-flight guard for importer runs.
//!
//! Watermark and day writes are read-then-write, so two concurrent runs of
//! the same importer would race each other. A session-scoped Postgres
//! advisory lock, keyed on the project name, makes the second run fail fast
//! instead. Different projects hash to different keys and stay concurrent.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{bail, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::debug;

fn lock_key(project_name: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    project_name.hash(&mut hasher);
    hasher.finish() as i64
}

pub struct ImportLock {
    // Advisory locks are session-scoped. Holding the connection keeps the
    // session, and with it the lock, alive for the whole run.
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl ImportLock {
    pub async fn acquire(db_pool: &PgPool, project_name: &str) -> Result<Self> {
        let key = lock_key(project_name);
        let mut conn = db_pool.acquire().await?;

        let acquired = sqlx::query_scalar::<Postgres, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            bail!("{project_name} import already running, refusing to start a second one");
        }

        debug!(project_name, key, "acquired import lock");

        Ok(Self { conn, key })
    }

    // Pooled connections outlive the guard, so release explicitly rather
    // than relying on drop. One-shot binaries also release on process exit.
    pub async fn release(mut self) -> Result<()> {
        sqlx::query_scalar::<Postgres, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *self.conn)
            .await?;

        debug!(key = self.key, "released import lock");

        Ok(())
    }
}
