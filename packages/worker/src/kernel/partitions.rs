//! Per-crawl partition lifecycle.
//!
//! Partition DDL and row-level DML from other running crawls can deadlock when
//! they interleave. All partition creation and removal goes through one
//! transaction-scoped advisory lock, held only for the DDL itself. The crawl
//! engine takes the same key in shared mode around its own writes.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::debug;

/// Advisory lock key shared with the crawl engine.
pub const PARTITION_LOCK_KEY: i64 = 12345;

/// Parent tables partitioned by `crawl_id`.
pub const PARTITIONED_TABLES: [&str; 4] = ["categories", "pages", "links", "html"];

/// Create every partition for `crawl_id` if missing.
///
/// Safe to call concurrently from several workers or from the engine: the
/// lock serializes callers and the DDL is `IF NOT EXISTS`, so the crawl ends
/// up with exactly one partition per table and no caller sees an error.
pub async fn ensure_partitions(pool: &PgPool, crawl_id: i32) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PARTITION_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .context("Failed to acquire partition lock")?;

    sqlx::query("SELECT create_crawl_partitions($1)")
        .bind(crawl_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to create partitions for crawl {}", crawl_id))?;

    tx.commit().await?;

    debug!(crawl_id, "partitions ready");
    Ok(())
}

/// Drop every partition of `crawl_id`. Only used when a crawl is deleted.
pub async fn drop_partitions(pool: &PgPool, crawl_id: i32) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PARTITION_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .context("Failed to acquire partition lock")?;

    sqlx::query("SELECT drop_crawl_partitions($1)")
        .bind(crawl_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to drop partitions for crawl {}", crawl_id))?;

    tx.commit().await?;

    debug!(crawl_id, "partitions dropped");
    Ok(())
}

/// Number of physical partitions that exist for `crawl_id`.
pub async fn partition_count(pool: &PgPool, crawl_id: i32) -> Result<i64> {
    let names = partition_names(crawl_id);

    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM pg_inherits i
        JOIN pg_class child ON child.oid = i.inhrelid
        JOIN pg_class parent ON parent.oid = i.inhparent
        WHERE child.relname = ANY($1)
          AND parent.relname = ANY($2)
        "#,
    )
    .bind(names)
    .bind(PARTITIONED_TABLES.map(str::to_string).to_vec())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Whether every partition of `crawl_id` exists.
pub async fn partitions_exist(pool: &PgPool, crawl_id: i32) -> Result<bool> {
    Ok(partition_count(pool, crawl_id).await? == PARTITIONED_TABLES.len() as i64)
}

/// Names of the physical partitions for `crawl_id`, e.g. `pages_42`.
pub fn partition_names(crawl_id: i32) -> Vec<String> {
    PARTITIONED_TABLES
        .iter()
        .map(|table| format!("{}_{}", table, crawl_id))
        .collect()
}
