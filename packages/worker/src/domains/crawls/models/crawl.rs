//! Crawl - one crawl run of a project, keyed by its directory name
//!
//! The crawl status mirrors the job driving it, with `completed` shown as
//! `finished` and `failed` as `error`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};

use crate::kernel::jobs::JobStatus;
use crate::kernel::partitions;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Crawl {
    pub id: i32,
    pub project_id: Option<i32>,
    /// Project directory; matches `jobs.project_dir`
    pub path: String,
    pub domain: String,
    pub status: String,
    pub config: serde_json::Value,
    pub in_progress: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Crawl {
    pub async fn create(
        project_id: Option<i32>,
        path: &str,
        domain: &str,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO crawls (project_id, path, domain)
             VALUES ($1, $2, $3)
             RETURNING *",
        )
        .bind(project_id)
        .bind(path)
        .bind(domain)
        .fetch_one(pool)
        .await
        .context("Failed to create crawl")
    }

    pub async fn find_by_id(id: i32, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM crawls WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch crawl")
    }

    pub async fn find_by_path(path: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM crawls WHERE path = $1")
            .bind(path)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch crawl")
    }

    pub async fn find_by_project(project_id: i32, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM crawls WHERE project_id = $1 ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch crawls for project")
    }

    /// Flag the crawl for `path` as running. `None` if no such crawl.
    pub async fn mark_running(path: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "UPDATE crawls
             SET status = 'running', in_progress = TRUE, finished_at = NULL
             WHERE path = $1
             RETURNING *",
        )
        .bind(path)
        .fetch_optional(pool)
        .await
        .context("Failed to mark crawl running")
    }

    /// Mirror a job status onto the crawl for `path`. A missing crawl row is
    /// not an error.
    pub async fn sync_job_status<'e, E: PgExecutor<'e>>(
        path: &str,
        status: JobStatus,
        executor: E,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls
             SET status = $2,
                 in_progress = $3,
                 finished_at = CASE WHEN $4 THEN NOW() ELSE finished_at END
             WHERE path = $1",
        )
        .bind(path)
        .bind(status.crawl_status())
        .bind(!status.is_terminal())
        .bind(status.is_terminal())
        .execute(executor)
        .await
        .with_context(|| format!("Failed to sync crawl status for {}", path))?;

        Ok(())
    }

    /// Crawl-level rule document, used when the project has none.
    pub async fn categorization_rules(id: i32, pool: &PgPool) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT config FROM categorization_config WHERE crawl_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch crawl categorization rules")
    }

    pub async fn save_categorization_rules(id: i32, document: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "INSERT INTO categorization_config (crawl_id, config)
             VALUES ($1, $2)
             ON CONFLICT (crawl_id) DO UPDATE SET config = EXCLUDED.config",
        )
        .bind(id)
        .bind(document)
        .execute(pool)
        .await
        .context("Failed to save crawl categorization rules")?;

        Ok(())
    }

    /// Delete a crawl and its partitions.
    pub async fn delete(id: i32, pool: &PgPool) -> Result<()> {
        partitions::drop_partitions(pool, id).await?;

        sqlx::query("DELETE FROM crawls WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete crawl")?;

        Ok(())
    }
}
