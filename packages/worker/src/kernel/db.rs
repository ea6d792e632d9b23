//! PostgreSQL connection setup.
//!
//! Every pooled connection gets the strict session timeouts below. Code that
//! needs to relax them (the job claim) does so with `SET LOCAL` inside its own
//! transaction, so the strict values come back on commit or rollback.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::debug;

/// Statement timeout applied to every session outside the claim window.
pub const STRICT_STATEMENT_TIMEOUT: &str = "120s";

/// Lock timeout, permissive enough for several crawls running side by side.
pub const LOCK_TIMEOUT: &str = "60s";

/// How long to wait on a lock before running deadlock detection.
pub const DEADLOCK_TIMEOUT: &str = "200ms";

/// A worker only ever needs a handful of connections: one for the loop, one
/// for partition DDL, and a spare for log writes.
pub const WORKER_MAX_CONNECTIONS: u32 = 3;

/// Connect to PostgreSQL with the worker session defaults.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(
                    format!(
                        "SET statement_timeout = '{}'; SET lock_timeout = '{}'",
                        STRICT_STATEMENT_TIMEOUT, LOCK_TIMEOUT
                    )
                    .as_str(),
                )
                .await?;
                // Needs elevated rights on managed instances; the server
                // default still applies when it is refused.
                if let Err(e) = conn
                    .execute(format!("SET deadlock_timeout = '{}'", DEADLOCK_TIMEOUT).as_str())
                    .await
                {
                    debug!(error = %e, "deadlock_timeout not applied");
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .context("Failed to connect to database")
}

/// Run the embedded schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")
}
