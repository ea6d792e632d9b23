//! Storage seam between the worker loop and PostgreSQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use super::job::{Job, JobLogLevel, RecoveredJobs};
use super::reconcile::Reconciliation;
use crate::domains::crawls::models::Crawl;
use crate::kernel::{db, partitions};

/// Everything the worker loop needs from the database.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Cheap liveness check of the current connection.
    async fn ping(&self) -> Result<()>;

    /// Replace the connection with a fresh one.
    async fn reconnect(&self) -> Result<()>;

    async fn claim_next_job(&self, pid: i32) -> Result<Option<Job>>;

    async fn add_log(&self, job_id: i64, message: &str, level: JobLogLevel) -> Result<()>;

    /// Mark the crawl behind `project_dir` as running. `None` if there is no
    /// crawl row for it.
    async fn start_crawl(&self, project_dir: &str) -> Result<Option<Crawl>>;

    async fn ensure_partitions(&self, crawl_id: i32) -> Result<()>;

    /// Finalize a job after its process exited with `exit_code`.
    async fn reconcile_exit(&self, job_id: i64, exit_code: i32) -> Result<Reconciliation>;

    /// Fail a claimed job whose engine was never started.
    async fn fail_job(&self, job_id: i64, message: &str) -> Result<()>;
}

/// [`JobStore`] backed by a reconnectable PostgreSQL pool.
pub struct PostgresJobStore {
    database_url: String,
    max_connections: u32,
    pool: RwLock<PgPool>,
}

impl PostgresJobStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let max_connections = db::WORKER_MAX_CONNECTIONS;
        let pool = db::connect(database_url, max_connections).await?;

        Ok(Self {
            database_url: database_url.to_string(),
            max_connections,
            pool: RwLock::new(pool),
        })
    }

    /// Wrap an existing pool. Reconnects will dial `database_url`.
    pub fn from_pool(pool: PgPool, database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            max_connections: db::WORKER_MAX_CONNECTIONS,
            pool: RwLock::new(pool),
        }
    }

    /// Current pool. Cheap to clone; callers must not hold it across a
    /// reconnect.
    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    pub async fn recover_orphans(&self) -> Result<RecoveredJobs> {
        let pool = self.pool().await;
        Job::recover_orphans(&pool).await
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn ping(&self) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = db::connect(&self.database_url, self.max_connections).await?;
        let stale = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        stale.close().await;

        info!("database connection re-established");
        Ok(())
    }

    async fn claim_next_job(&self, pid: i32) -> Result<Option<Job>> {
        let pool = self.pool().await;
        Job::claim_next(pid, &pool).await
    }

    async fn add_log(&self, job_id: i64, message: &str, level: JobLogLevel) -> Result<()> {
        let pool = self.pool().await;
        Job::add_log(job_id, message, level, &pool).await
    }

    async fn start_crawl(&self, project_dir: &str) -> Result<Option<Crawl>> {
        let pool = self.pool().await;
        Crawl::mark_running(project_dir, &pool).await
    }

    async fn ensure_partitions(&self, crawl_id: i32) -> Result<()> {
        let pool = self.pool().await;
        partitions::ensure_partitions(&pool, crawl_id).await
    }

    async fn reconcile_exit(&self, job_id: i64, exit_code: i32) -> Result<Reconciliation> {
        let pool = self.pool().await;
        Job::reconcile_exit(job_id, exit_code, &pool).await
    }

    async fn fail_job(&self, job_id: i64, message: &str) -> Result<()> {
        let pool = self.pool().await;
        Job::mark_failed(job_id, message, &pool).await?;
        Ok(())
    }
}
