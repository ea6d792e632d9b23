//! Job model for crawl and batch-categorization runs.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool};
use thiserror::Error;

use crate::domains::crawls::models::Crawl;
use crate::kernel::db::{LOCK_TIMEOUT, STRICT_STATEMENT_TIMEOUT};

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of a job row.
///
/// `queued -> running -> (completed | failed | stopping -> stopped)`.
/// `pending` is reserved for jobs created before they are ready to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    #[default]
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Stopping,
        JobStatus::Stopped,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Stopping => "stopping",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// No worker will touch the job again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Completed | JobStatus::Failed
        )
    }

    /// Status the owning crawl row reports for this job status.
    pub fn crawl_status(&self) -> &'static str {
        match self {
            JobStatus::Completed => "finished",
            JobStatus::Failed => "error",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownJobStatus(s.to_string()))
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownJobStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What a job asks the engine to do, decoded from the `command` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    Crawl,
    Resume,
    /// `batch-categorize-project:<project id>`; the argument is passed to the
    /// engine verbatim.
    BatchCategorize { argument: String },
}

pub const BATCH_CATEGORIZE_PREFIX: &str = "batch-categorize-project:";

impl JobCommand {
    /// Unknown commands run as a fresh crawl.
    pub fn parse(command: &str) -> Self {
        match command.trim() {
            "resume" => JobCommand::Resume,
            c if c.starts_with(BATCH_CATEGORIZE_PREFIX) => JobCommand::BatchCategorize {
                argument: c.to_string(),
            },
            _ => JobCommand::Crawl,
        }
    }

    /// Crawl and resume jobs drive a crawl row and its partitions.
    pub fn is_crawl(&self) -> bool {
        matches!(self, JobCommand::Crawl | JobCommand::Resume)
    }

    /// Project id of a batch categorization, if the argument carries one.
    pub fn project_id(&self) -> Option<i32> {
        match self {
            JobCommand::BatchCategorize { argument } => argument
                .strip_prefix(BATCH_CATEGORIZE_PREFIX)
                .and_then(|id| id.trim().parse().ok()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobLogLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl JobLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLogLevel::Info => "info",
            JobLogLevel::Success => "success",
            JobLogLevel::Warning => "warning",
            JobLogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: i64,
    pub project_dir: String,
    pub project_name: String,
    pub command: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub progress: i32,
    pub pid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: i64,
    pub message: String,
    pub level: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveredJobs {
    /// `running` jobs put back in the queue
    pub requeued: Vec<Job>,
    /// `stopping` jobs finalized as `stopped`
    pub stopped: Vec<Job>,
}

impl RecoveredJobs {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.stopped.is_empty()
    }
}

impl Job {
    pub fn kind(&self) -> JobCommand {
        JobCommand::parse(&self.command)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_dir, project_name, command, status, progress, pid,
                   created_at, started_at, finished_at, error_message
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Most recent job for a project, whatever its status.
    pub async fn find_latest_for_project(project_dir: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_dir, project_name, command, status, progress, pid,
                   created_at, started_at, finished_at, error_message
            FROM jobs
            WHERE project_dir = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(project_dir)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    pub async fn find_by_status(status: JobStatus, pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_dir, project_name, command, status, progress, pid,
                   created_at, started_at, finished_at, error_message
            FROM jobs
            WHERE status = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;

        Ok(jobs)
    }

    /// Queue a job. Crawl jobs also flag their crawl row as queued.
    pub async fn enqueue(
        project_dir: &str,
        project_name: &str,
        command: &str,
        pool: &PgPool,
    ) -> Result<Self> {
        let mut tx = pool.begin().await?;

        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (project_dir, project_name, command, status)
            VALUES ($1, $2, $3, 'queued')
            RETURNING id, project_dir, project_name, command, status, progress, pid,
                      created_at, started_at, finished_at, error_message
            "#,
        )
        .bind(project_dir)
        .bind(project_name)
        .bind(command)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert job")?;

        Job::add_log(job.id, "Job queued", JobLogLevel::Info, &mut *tx).await?;

        if job.kind().is_crawl() {
            Crawl::sync_job_status(&job.project_dir, JobStatus::Queued, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(job)
    }

    /// Claim the oldest queued job for the process `pid`.
    ///
    /// Concurrent claimers never receive the same job: rows locked by another
    /// claimer are skipped rather than waited on. The statement timeout is
    /// lifted for the claim itself, since a busy queue can make the locking
    /// select slow, and restored before the transaction ends.
    pub async fn claim_next(pid: i32, pool: &PgPool) -> Result<Option<Self>> {
        let mut tx = pool.begin().await?;

        sqlx::query("SET LOCAL statement_timeout = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}'", LOCK_TIMEOUT))
            .execute(&mut *tx)
            .await?;

        let job = sqlx::query_as::<_, Self>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                status = 'running',
                started_at = NOW(),
                finished_at = NULL,
                pid = $1
            WHERE id IN (SELECT id FROM next_job)
            RETURNING id, project_dir, project_name, command, status, progress, pid,
                      created_at, started_at, finished_at, error_message
            "#,
        )
        .bind(pid)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to claim job")?;

        sqlx::query(&format!(
            "SET LOCAL statement_timeout = '{}'",
            STRICT_STATEMENT_TIMEOUT
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    pub async fn add_log<'e, E: PgExecutor<'e>>(
        job_id: i64,
        message: &str,
        level: JobLogLevel,
        executor: E,
    ) -> Result<()> {
        sqlx::query("INSERT INTO job_logs (job_id, message, level) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(message)
            .bind(level.as_str())
            .execute(executor)
            .await
            .with_context(|| format!("Failed to write log for job {}", job_id))?;

        Ok(())
    }

    pub async fn logs(job_id: i64, pool: &PgPool) -> Result<Vec<JobLog>> {
        let logs = sqlx::query_as::<_, JobLog>(
            r#"
            SELECT id, job_id, message, level, created_at
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;

        Ok(logs)
    }

    pub async fn update_progress(job_id: i64, progress: i32, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1")
            .bind(job_id)
            .bind(progress.clamp(0, 100))
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn current_status(job_id: i64, pool: &PgPool) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;

        Ok(status.map(|s| s.parse::<JobStatus>()).transpose()?)
    }

    /// Ask a job to stop.
    ///
    /// A running job moves to `stopping`; the engine polls for it and exits,
    /// then the worker finalizes the job as `stopped`. A job still waiting in
    /// the queue is stopped at once. Returns the new status, or `None` if the
    /// job was in neither state.
    pub async fn request_stop(job_id: i64, pool: &PgPool) -> Result<Option<JobStatus>> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query_as::<_, (String, String, String)>(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'running' THEN 'stopping' ELSE 'stopped' END,
                finished_at = CASE WHEN status = 'queued' THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status IN ('running', 'queued')
            RETURNING status, project_dir, command
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("Failed to stop job {}", job_id))?;

        let Some((status, project_dir, command)) = row else {
            return Ok(None);
        };
        let status: JobStatus = status.parse()?;

        let message = match status {
            JobStatus::Stopping => "Stop requested",
            _ => "Job stopped before it started",
        };
        Job::add_log(job_id, message, JobLogLevel::Warning, &mut *tx).await?;
        if JobCommand::parse(&command).is_crawl() {
            Crawl::sync_job_status(&project_dir, status, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(Some(status))
    }

    /// Recover jobs orphaned by a worker that died mid-run.
    ///
    /// `running` rows go back to `queued`; rows locked by a live claimer are
    /// left alone. `stopping` rows are finalized as `stopped`.
    ///
    /// Any `running` row is assumed orphaned, so this must only run while no
    /// other worker is executing jobs.
    pub async fn recover_orphans(pool: &PgPool) -> Result<RecoveredJobs> {
        let mut tx = pool.begin().await?;

        let requeued = sqlx::query_as::<_, Self>(
            r#"
            WITH orphans AS (
                SELECT id
                FROM jobs
                WHERE status = 'running'
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'queued', started_at = NULL, pid = NULL
            WHERE id IN (SELECT id FROM orphans)
            RETURNING id, project_dir, project_name, command, status, progress, pid,
                      created_at, started_at, finished_at, error_message
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to requeue orphaned jobs")?;

        for job in &requeued {
            Job::add_log(
                job.id,
                "Job recovered after worker restart, re-queued",
                JobLogLevel::Warning,
                &mut *tx,
            )
            .await?;
            if job.kind().is_crawl() {
                Crawl::sync_job_status(&job.project_dir, JobStatus::Queued, &mut *tx).await?;
            }
        }

        let stopped = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs
            SET status = 'stopped', finished_at = NOW()
            WHERE status = 'stopping'
            RETURNING id, project_dir, project_name, command, status, progress, pid,
                      created_at, started_at, finished_at, error_message
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to finalize stopping jobs")?;

        for job in &stopped {
            Job::add_log(
                job.id,
                "Job stopped during worker restart",
                JobLogLevel::Warning,
                &mut *tx,
            )
            .await?;
            if job.kind().is_crawl() {
                Crawl::sync_job_status(&job.project_dir, JobStatus::Stopped, &mut *tx).await?;
            }
        }

        tx.commit().await?;

        Ok(RecoveredJobs { requeued, stopped })
    }

    /// Operator reset after a crash or deploy: every queued, running or
    /// stopping job becomes `stopped`, and its crawl likewise.
    pub async fn reset_stuck(pool: &PgPool) -> Result<Vec<Self>> {
        let mut tx = pool.begin().await?;

        let reset = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs
            SET status = 'stopped', finished_at = NOW()
            WHERE status IN ('queued', 'running', 'stopping')
            RETURNING id, project_dir, project_name, command, status, progress, pid,
                      created_at, started_at, finished_at, error_message
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to reset stuck jobs")?;

        for job in &reset {
            Job::add_log(job.id, "Reset by operator", JobLogLevel::Warning, &mut *tx).await?;
            if job.kind().is_crawl() {
                Crawl::sync_job_status(&job.project_dir, JobStatus::Stopped, &mut *tx).await?;
            }
        }

        tx.commit().await?;
        Ok(reset)
    }
}
