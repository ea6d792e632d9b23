//! The long-running worker loop.
//!
//! One iteration:
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► Liveness check (ping, reconnect on failure)
//!     ├─► Claim oldest queued job (SKIP LOCKED)
//!     │       └─► none: sleep poll_interval
//!     ├─► Crawl jobs: mark crawl running, ensure partitions
//!     │       └─► failure: mark job failed, engine never runs
//!     ├─► Run engine subprocess (blocks until exit)
//!     └─► Reconcile final status from exit code (retried)
//! ```
//!
//! Failures are counted per iteration. Each failure backs off exponentially;
//! a connection-class failure also rebuilds the connection. After
//! `max_consecutive_errors` failures in a row the loop returns
//! [`WorkerError::TooManyConsecutiveErrors`] so the process can exit and be
//! restarted by its supervisor. Any successful iteration resets the count.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::{Backoff, ErrorClass, WorkerError};
use super::job::{Job, JobLogLevel};
use super::job_store::JobStore;
use super::reconcile::Reconciliation;
use crate::config::Config;
use crate::kernel::supervisor::{
    EngineInvocation, EngineSettings, ProcessSupervisor, ABNORMAL_EXIT_CODE,
};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Worker ID for log lines
    pub worker_id: String,
    /// Recorded on claimed jobs
    pub pid: i32,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Consecutive failed iterations before giving up
    pub max_consecutive_errors: u32,
    /// Emit a heartbeat log every N polls
    pub heartbeat_every_polls: u64,
    pub backoff: Backoff,
    /// Pause after the liveness check fails to reconnect
    pub reconnect_retry_delay: Duration,
    /// Extra pause after a reconnect attempt on the error path fails
    pub reconnect_failure_delay: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            pid: std::process::id() as i32,
            poll_interval: Duration::from_secs(2),
            max_consecutive_errors: 10,
            heartbeat_every_polls: 100,
            backoff: Backoff::default(),
            reconnect_retry_delay: Duration::from_secs(5),
            reconnect_failure_delay: Duration::from_secs(10),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval,
            max_consecutive_errors: config.max_consecutive_errors,
            heartbeat_every_polls: config.heartbeat_every_polls,
            ..Default::default()
        }
    }
}

/// Loop-local health counters.
#[derive(Debug)]
struct LoopHealth {
    polls: u64,
    consecutive_errors: u32,
    last_heartbeat: Instant,
}

impl LoopHealth {
    fn new() -> Self {
        Self {
            polls: 0,
            consecutive_errors: 0,
            last_heartbeat: Instant::now(),
        }
    }

    fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    fn record_failure(&mut self) -> u32 {
        self.consecutive_errors += 1;
        self.consecutive_errors
    }

    fn heartbeat_due(&self, every: u64) -> bool {
        every > 0 && self.polls % every == 0
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Iteration {
    Idle,
    Processed,
}

pub struct JobWorker<S: JobStore, P: ProcessSupervisor> {
    store: Arc<S>,
    supervisor: Arc<P>,
    engine: EngineSettings,
    config: JobWorkerConfig,
}

impl<S: JobStore, P: ProcessSupervisor> JobWorker<S, P> {
    pub fn new(
        store: Arc<S>,
        supervisor: Arc<P>,
        engine: EngineSettings,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            engine,
            config,
        }
    }

    /// Run until `shutdown` is cancelled or too many iterations fail in a row.
    ///
    /// Cancellation is observed between iterations and while sleeping, never
    /// while an engine process is running.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            pid = self.config.pid,
            max_consecutive_errors = self.config.max_consecutive_errors,
            "job worker starting"
        );

        let mut health = LoopHealth::new();

        while !shutdown.is_cancelled() {
            health.polls += 1;
            if health.heartbeat_due(self.config.heartbeat_every_polls) {
                info!(
                    worker_id = %self.config.worker_id,
                    polls = health.polls,
                    consecutive_errors = health.consecutive_errors,
                    since_last_secs = health.last_heartbeat.elapsed().as_secs(),
                    "worker heartbeat"
                );
                health.last_heartbeat = Instant::now();
            }

            match self.run_iteration(&shutdown).await {
                Ok(Iteration::Processed) => health.record_success(),
                Ok(Iteration::Idle) => {
                    health.record_success();
                    sleep_or_shutdown(self.config.poll_interval, &shutdown).await;
                }
                Err(e) => {
                    let failures = health.record_failure();
                    let class = ErrorClass::of(&e);
                    error!(
                        worker_id = %self.config.worker_id,
                        failures,
                        max = self.config.max_consecutive_errors,
                        class = ?class,
                        error = %format!("{:#}", e),
                        "worker iteration failed"
                    );

                    if failures >= self.config.max_consecutive_errors {
                        error!(
                            worker_id = %self.config.worker_id,
                            failures,
                            "too many consecutive errors, exiting for restart"
                        );
                        return Err(WorkerError::TooManyConsecutiveErrors { count: failures });
                    }

                    if class.needs_reconnect() {
                        warn!("database issue detected, reconnecting");
                        if let Err(e) = self.store.reconnect().await {
                            warn!(error = %e, "reconnect failed");
                            sleep_or_shutdown(self.config.reconnect_failure_delay, &shutdown)
                                .await;
                        }
                    }

                    let delay = self.config.backoff.delay(failures);
                    info!(delay_ms = delay.as_millis() as u64, "backing off");
                    sleep_or_shutdown(delay, &shutdown).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    async fn run_iteration(&self, shutdown: &CancellationToken) -> Result<Iteration> {
        if let Err(e) = self.store.ping().await {
            warn!(error = %e, "database connection lost, reconnecting");
            if let Err(e) = self.store.reconnect().await {
                sleep_or_shutdown(self.config.reconnect_retry_delay, shutdown).await;
                return Err(e.context("Reconnection after failed liveness check"));
            }
        }

        let Some(job) = self.store.claim_next_job(self.config.pid).await? else {
            return Ok(Iteration::Idle);
        };

        self.process(job, shutdown).await?;
        Ok(Iteration::Processed)
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) -> Result<()> {
        info!(
            job_id = job.id,
            project_dir = %job.project_dir,
            command = %job.command,
            "picked up job"
        );

        let invocation = self.engine.invocation_for(&job);

        if let Err(e) = self.prepare(&job, &invocation).await {
            error!(job_id = job.id, error = %format!("{:#}", e), "job preparation failed");
            let message = format!("Job preparation failed: {:#}", e);
            self.finalize(job.id, "mark job failed", shutdown, || {
                self.store.fail_job(job.id, &message)
            })
            .await?;
            return Err(e.context(format!("Preparing job {}", job.id)));
        }

        info!(job_id = job.id, log = %invocation.log_path.display(), "starting engine");
        let exit_code = match self.supervisor.run(&invocation).await {
            Ok(code) => code,
            Err(e) => {
                error!(job_id = job.id, error = %format!("{:#}", e), "engine failed to start");
                ABNORMAL_EXIT_CODE
            }
        };
        info!(job_id = job.id, exit_code, "engine exited");

        let outcome = self
            .finalize(job.id, "reconcile exit status", shutdown, || {
                self.store.reconcile_exit(job.id, exit_code)
            })
            .await?;
        match outcome {
            Reconciliation::Completed => info!(job_id = job.id, "job completed"),
            Reconciliation::Stopped => info!(job_id = job.id, "job stopped"),
            Reconciliation::Failed { exit_code } => {
                warn!(job_id = job.id, exit_code, "job failed")
            }
            Reconciliation::Unchanged => {
                info!(job_id = job.id, "job status already final, left unchanged")
            }
        }

        Ok(())
    }

    /// Everything between the claim and the engine start.
    async fn prepare(&self, job: &Job, invocation: &EngineInvocation) -> Result<()> {
        self.store
            .add_log(
                job.id,
                &invocation.marker.job_log_message(&self.config.worker_id),
                JobLogLevel::Info,
            )
            .await?;

        if job.kind().is_crawl() {
            self.prepare_crawl(job).await?;
        }

        Ok(())
    }

    /// Mark the crawl running and create its partitions up front, so the
    /// engine does not race other crawls for DDL locks. Partition failure is
    /// not fatal: the engine creates missing partitions itself.
    async fn prepare_crawl(&self, job: &Job) -> Result<()> {
        let Some(crawl) = self.store.start_crawl(&job.project_dir).await? else {
            warn!(job_id = job.id, project_dir = %job.project_dir, "no crawl row for project");
            return Ok(());
        };

        match self.store.ensure_partitions(crawl.id).await {
            Ok(()) => info!(job_id = job.id, crawl_id = crawl.id, "partitions ready"),
            Err(e) => warn!(
                job_id = job.id,
                crawl_id = crawl.id,
                error = %format!("{:#}", e),
                "partition creation failed, engine will retry"
            ),
        }

        Ok(())
    }

    /// Record the final state of a claimed job, retrying through store
    /// outages with reconnect and backoff.
    ///
    /// Gives up after `max_consecutive_errors` attempts, or once shutdown is
    /// requested; the job then stays `running` until orphan recovery.
    async fn finalize<T, F, Fut>(
        &self,
        job_id: i64,
        action: &str,
        shutdown: &CancellationToken,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let e = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempts >= self.config.max_consecutive_errors || shutdown.is_cancelled() {
                error!(
                    job_id,
                    action,
                    attempts,
                    error = %format!("{:#}", e),
                    "giving up, job left for orphan recovery"
                );
                return Err(e.context(format!("Failed to {} for job {}", action, job_id)));
            }

            let class = ErrorClass::of(&e);
            warn!(
                job_id,
                action,
                attempts,
                class = ?class,
                error = %format!("{:#}", e),
                "store unavailable while finalizing job, retrying"
            );
            if class.needs_reconnect() {
                if let Err(e) = self.store.reconnect().await {
                    warn!(error = %e, "reconnect failed");
                }
            }
            sleep_or_shutdown(self.config.backoff.delay(attempts), shutdown).await;
        }
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
