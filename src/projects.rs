//! The project registry.
//!
//! One row per tracked protocol, holding the opaque import watermark and the manual
//! re-import-from-scratch flag. Rows are created lazily the first time an importer runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use mockall::automock;
use sqlx::{PgPool, Postgres};

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Project {
    pub id: i32,
    pub name: String,
    pub last_imported_id: Option<String>,
    /// Operator escape hatch: when set, the next run resets the watermark to the protocol's
    /// epoch, clears the flag, and re-imports from scratch.
    pub delete: bool,
}

#[automock]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_or_create(&self, name: &str, epoch_watermark: &str) -> Project;
    async fn watermark(&self, name: &str) -> Option<String>;
    async fn set_watermark(&self, name: &str, watermark: &str);
    /// Writes the epoch watermark and clears the delete flag, returning the updated row.
    async fn reset(&self, name: &str, epoch_watermark: &str) -> Project;
    async fn set_delete(&self, name: &str, delete: bool);
}

pub struct ProjectStorePostgres {
    db_pool: PgPool,
}

impl ProjectStorePostgres {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ProjectStore for ProjectStorePostgres {
    async fn get_or_create(&self, name: &str, epoch_watermark: &str) -> Project {
        let existing = sqlx::query_as::<Postgres, Project>(
            r#"
            SELECT id, name, last_imported_id, "delete"
            FROM projects
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.db_pool)
        .await
        .unwrap();

        match existing {
            Some(project) => project,
            None => sqlx::query_as::<Postgres, Project>(
                r#"
                INSERT INTO projects (name, last_imported_id)
                VALUES ($1, $2)
                RETURNING id, name, last_imported_id, "delete"
                "#,
            )
            .bind(name)
            .bind(epoch_watermark)
            .fetch_one(&self.db_pool)
            .await
            .unwrap(),
        }
    }

    async fn watermark(&self, name: &str) -> Option<String> {
        sqlx::query_scalar::<Postgres, Option<String>>(
            "
            SELECT last_imported_id
            FROM projects
            WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&self.db_pool)
        .await
        .unwrap()
        .flatten()
    }

    async fn set_watermark(&self, name: &str, watermark: &str) {
        sqlx::query(
            "
            UPDATE projects
            SET last_imported_id = $2
            WHERE name = $1
            ",
        )
        .bind(name)
        .bind(watermark)
        .execute(&self.db_pool)
        .await
        .unwrap();
    }

    async fn reset(&self, name: &str, epoch_watermark: &str) -> Project {
        sqlx::query_as::<Postgres, Project>(
            r#"
            UPDATE projects
            SET last_imported_id = $2, "delete" = FALSE
            WHERE name = $1
            RETURNING id, name, last_imported_id, "delete"
            "#,
        )
        .bind(name)
        .bind(epoch_watermark)
        .fetch_one(&self.db_pool)
        .await
        .unwrap()
    }

    async fn set_delete(&self, name: &str, delete: bool) {
        sqlx::query(
            r#"
            UPDATE projects
            SET "delete" = $2
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(delete)
        .execute(&self.db_pool)
        .await
        .unwrap();
    }
}

/// In-memory store for importer tests that don't want a database.
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_or_create(&self, name: &str, epoch_watermark: &str) -> Project {
        let mut projects = self.projects.lock().unwrap();
        let next_id = projects.len() as i32 + 1;
        projects
            .entry(name.to_string())
            .or_insert_with(|| Project {
                id: next_id,
                name: name.to_string(),
                last_imported_id: Some(epoch_watermark.to_string()),
                delete: false,
            })
            .clone()
    }

    async fn watermark(&self, name: &str) -> Option<String> {
        self.projects
            .lock()
            .unwrap()
            .get(name)
            .and_then(|project| project.last_imported_id.clone())
    }

    async fn set_watermark(&self, name: &str, watermark: &str) {
        if let Some(project) = self.projects.lock().unwrap().get_mut(name) {
            project.last_imported_id = Some(watermark.to_string());
        }
    }

    async fn reset(&self, name: &str, epoch_watermark: &str) -> Project {
        let mut projects = self.projects.lock().unwrap();
        let project = projects
            .get_mut(name)
            .expect("expect project to exist before resetting it");
        project.last_imported_id = Some(epoch_watermark.to_string());
        project.delete = false;
        project.clone()
    }

    async fn set_delete(&self, name: &str, delete: bool) {
        if let Some(project) = self.projects.lock().unwrap().get_mut(name) {
            project.delete = delete;
        }
    }
}
