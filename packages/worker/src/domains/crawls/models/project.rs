//! Project - groups crawls of the same site and owns their categorization rules

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Project {
    pub id: i32,
    pub name: String,
    /// YAML rule document shared by every crawl of the project
    pub categorization_config: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub async fn create(name: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("INSERT INTO projects (name) VALUES ($1) RETURNING *")
            .bind(name)
            .fetch_one(pool)
            .await
            .context("Failed to create project")
    }

    pub async fn find_by_id(id: i32, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch project")
    }

    pub async fn set_categorization_config(id: i32, document: Option<&str>, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE projects SET categorization_config = $2 WHERE id = $1")
            .bind(id)
            .bind(document)
            .execute(pool)
            .await
            .context("Failed to save project categorization rules")?;

        Ok(())
    }
}
