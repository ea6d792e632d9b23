//! Final status of a job once its engine process has exited.

use anyhow::{Context, Result};
use sqlx::PgPool;

use super::job::{Job, JobCommand, JobLogLevel, JobStatus};
use crate::domains::crawls::models::Crawl;

/// What to do with a job after its process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Stop was requested and the engine exited cleanly.
    Stopped,
    Completed,
    Failed { exit_code: i32 },
    /// The status was already final (or changed under us); leave it.
    Unchanged,
}

/// Decide the final status from the status read after exit and the exit code.
///
/// A non-zero exit fails anything not explicitly stopped, including a job
/// that was asked to stop and then crashed on the way out.
pub fn reconcile(current: JobStatus, exit_code: i32) -> Reconciliation {
    match (exit_code, current) {
        (0, JobStatus::Stopping) => Reconciliation::Stopped,
        (0, JobStatus::Running) => Reconciliation::Completed,
        (0, _) => Reconciliation::Unchanged,
        (_, JobStatus::Stopped) => Reconciliation::Unchanged,
        (code, _) => Reconciliation::Failed { exit_code: code },
    }
}

impl Reconciliation {
    pub fn target_status(&self) -> Option<JobStatus> {
        match self {
            Reconciliation::Stopped => Some(JobStatus::Stopped),
            Reconciliation::Completed => Some(JobStatus::Completed),
            Reconciliation::Failed { .. } => Some(JobStatus::Failed),
            Reconciliation::Unchanged => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Reconciliation::Failed { exit_code } => {
                Some(format!("Process exited with error code {}", exit_code))
            }
            _ => None,
        }
    }

    fn log_entry(&self) -> Option<(String, JobLogLevel)> {
        match self {
            Reconciliation::Stopped => Some(("Job stopped".to_string(), JobLogLevel::Warning)),
            Reconciliation::Completed => {
                Some(("Job completed successfully".to_string(), JobLogLevel::Success))
            }
            Reconciliation::Failed { exit_code } => Some((
                format!("Job failed with exit code {}", exit_code),
                JobLogLevel::Error,
            )),
            Reconciliation::Unchanged => None,
        }
    }
}

impl Job {
    /// Apply [`reconcile`] to the stored row.
    ///
    /// The current status is read under a row lock so a concurrent stop
    /// request cannot slip in between the read and the write. A job row
    /// deleted while its process ran is left alone.
    pub async fn reconcile_exit(job_id: i64, exit_code: i32, pool: &PgPool) -> Result<Reconciliation> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT status, project_dir, command FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("Failed to read status of job {}", job_id))?;

        let Some((status, project_dir, command)) = row else {
            return Ok(Reconciliation::Unchanged);
        };

        let current: JobStatus = status.parse()?;
        let outcome = reconcile(current, exit_code);

        let Some(target) = outcome.target_status() else {
            return Ok(outcome);
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                finished_at = NOW(),
                error_message = COALESCE($3, error_message)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(target.as_str())
        .bind(outcome.error_message())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to finalize job {}", job_id))?;

        if let Some((message, level)) = outcome.log_entry() {
            Job::add_log(job_id, &message, level, &mut *tx).await?;
        }

        if JobCommand::parse(&command).is_crawl() {
            Crawl::sync_job_status(&project_dir, target, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

impl Job {
    /// Fail a claimed job that never reached its engine. Only `running` and
    /// `stopping` jobs are touched; returns whether the row changed.
    pub async fn mark_failed(job_id: i64, message: &str, pool: &PgPool) -> Result<bool> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query_as::<_, (String, String)>(
            r#"
            UPDATE jobs
            SET status = 'failed', finished_at = NOW(), error_message = $2
            WHERE id = $1 AND status IN ('running', 'stopping')
            RETURNING project_dir, command
            "#,
        )
        .bind(job_id)
        .bind(message)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("Failed to mark job {} failed", job_id))?;

        let Some((project_dir, command)) = row else {
            return Ok(false);
        };

        Job::add_log(job_id, message, JobLogLevel::Error, &mut *tx).await?;
        if JobCommand::parse(&command).is_crawl() {
            Crawl::sync_job_status(&project_dir, JobStatus::Failed, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
