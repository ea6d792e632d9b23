//! In-memory doubles for exercising the worker loop without PostgreSQL or
//! real engine processes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobLogLevel, JobStatus};
use super::job_store::JobStore;
use super::reconcile::{reconcile, Reconciliation};
use crate::domains::crawls::models::Crawl;
use crate::kernel::supervisor::{EngineInvocation, ProcessSupervisor};

#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Other,
    Connection,
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    crawls: HashMap<String, i32>,
    logs: Vec<(i64, String)>,
    claim_script: VecDeque<bool>,
    failing_claims: usize,
    failure_kind: Option<FailureKind>,
    failing_pings: usize,
    fail_partitions: bool,
    fail_start_crawl: bool,
    failing_reconciles: usize,
    reconcile_attempts: usize,
    cancel_when_idle: Option<CancellationToken>,
    claim_attempts: usize,
    claimed_pids: Vec<i32>,
    reconnects: usize,
    partitions: Vec<i32>,
    exit_codes: Vec<i32>,
}

/// [`JobStore`] over an in-memory job list with scriptable failures.
#[derive(Default)]
pub struct MockJobStore {
    state: Mutex<State>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job; `crawl_id` registers a crawl row for its project.
    pub fn enqueue(&self, project_dir: &str, command: &str, crawl_id: Option<i32>) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.jobs.len() as i64 + 1;
        state.jobs.push(Job {
            id,
            project_dir: project_dir.to_string(),
            project_name: project_dir.to_string(),
            command: command.to_string(),
            status: JobStatus::Queued,
            progress: 0,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        });
        if let Some(crawl_id) = crawl_id {
            state.crawls.insert(project_dir.to_string(), crawl_id);
        }
        id
    }

    pub fn fail_claims(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.failing_claims = count;
        state.failure_kind = Some(FailureKind::Other);
    }

    pub fn fail_claims_with_connection_errors(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.failing_claims = count;
        state.failure_kind = Some(FailureKind::Connection);
    }

    /// Per-claim outcomes consumed before anything else: `true` claims
    /// normally, `false` fails.
    pub fn script_claims(&self, script: Vec<bool>) {
        self.state.lock().unwrap().claim_script = script.into();
    }

    pub fn fail_claims_after_script(&self) {
        self.fail_claims(usize::MAX);
    }

    pub fn fail_pings(&self, count: usize) {
        self.state.lock().unwrap().failing_pings = count;
    }

    pub fn fail_partitions(&self) {
        self.state.lock().unwrap().fail_partitions = true;
    }

    pub fn fail_start_crawl(&self) {
        self.state.lock().unwrap().fail_start_crawl = true;
    }

    /// Fail the next `count` reconciliations with a connection-class error.
    pub fn fail_reconciles(&self, count: usize) {
        self.state.lock().unwrap().failing_reconciles = count;
    }

    /// Cancel `token` the first time a claim finds the queue empty.
    pub fn cancel_when_idle(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_when_idle = Some(token);
    }

    pub fn claim_attempts(&self) -> usize {
        self.state.lock().unwrap().claim_attempts
    }

    pub fn claimed_pids(&self) -> Vec<i32> {
        self.state.lock().unwrap().claimed_pids.clone()
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().unwrap().reconnects
    }

    pub fn partitions_ensured(&self) -> Vec<i32> {
        self.state.lock().unwrap().partitions.clone()
    }

    pub fn reconcile_attempts(&self) -> usize {
        self.state.lock().unwrap().reconcile_attempts
    }

    pub fn error_of(&self, job_id: i64) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .and_then(|j| j.error_message.clone())
    }

    pub fn exit_codes(&self) -> Vec<i32> {
        self.state.lock().unwrap().exit_codes.clone()
    }

    pub fn status_of(&self, job_id: i64) -> Option<JobStatus> {
        let state = self.state.lock().unwrap();
        state.jobs.iter().find(|j| j.id == job_id).map(|j| j.status)
    }

    pub fn logs_for(&self, job_id: i64) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            return Err(anyhow!("server closed the connection unexpectedly"));
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.state.lock().unwrap().reconnects += 1;
        Ok(())
    }

    async fn claim_next_job(&self, pid: i32) -> Result<Option<Job>> {
        let mut state = self.state.lock().unwrap();
        state.claim_attempts += 1;

        let fail = match state.claim_script.pop_front() {
            Some(succeed) => !succeed,
            None if state.failing_claims > 0 => {
                state.failing_claims -= 1;
                true
            }
            None => false,
        };
        if fail {
            return Err(match state.failure_kind {
                Some(FailureKind::Connection) => anyhow::Error::new(sqlx::Error::PoolTimedOut),
                _ => anyhow!("claim failed"),
            });
        }

        let next = state.jobs.iter().position(|j| j.status == JobStatus::Queued);
        let Some(index) = next else {
            if let Some(token) = state.cancel_when_idle.take() {
                token.cancel();
            }
            return Ok(None);
        };
        let job = &mut state.jobs[index];
        job.status = JobStatus::Running;
        job.pid = Some(pid);
        job.started_at = Some(Utc::now());
        let job = job.clone();
        state.claimed_pids.push(pid);
        Ok(Some(job))
    }

    async fn add_log(&self, job_id: i64, message: &str, _level: JobLogLevel) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .logs
            .push((job_id, message.to_string()));
        Ok(())
    }

    async fn start_crawl(&self, project_dir: &str) -> Result<Option<Crawl>> {
        let state = self.state.lock().unwrap();
        if state.fail_start_crawl {
            return Err(anyhow!("crawl row is locked"));
        }
        Ok(state.crawls.get(project_dir).map(|&id| Crawl {
            id,
            project_id: None,
            path: project_dir.to_string(),
            domain: String::new(),
            status: JobStatus::Running.crawl_status().to_string(),
            config: serde_json::Value::Null,
            in_progress: true,
            created_at: Utc::now(),
            finished_at: None,
        }))
    }

    async fn ensure_partitions(&self, crawl_id: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_partitions {
            return Err(anyhow!("lock timeout"));
        }
        state.partitions.push(crawl_id);
        Ok(())
    }

    async fn reconcile_exit(&self, job_id: i64, exit_code: i32) -> Result<Reconciliation> {
        let mut state = self.state.lock().unwrap();
        state.reconcile_attempts += 1;
        if state.failing_reconciles > 0 {
            state.failing_reconciles -= 1;
            return Err(anyhow::Error::new(sqlx::Error::PoolTimedOut));
        }
        state.exit_codes.push(exit_code);
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(Reconciliation::Unchanged);
        };
        let outcome = reconcile(job.status, exit_code);
        if let Some(target) = outcome.target_status() {
            job.status = target;
            job.finished_at = Some(Utc::now());
            job.error_message = outcome.error_message();
        }
        Ok(outcome)
    }

    async fn fail_job(&self, job_id: i64, message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && matches!(j.status, JobStatus::Running | JobStatus::Stopping))
        else {
            return Ok(());
        };
        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        job.error_message = Some(message.to_string());
        state.logs.push((job_id, message.to_string()));
        Ok(())
    }
}

/// [`ProcessSupervisor`] that records invocations and returns a fixed result.
pub struct ScriptedSupervisor {
    exit_code: Option<i32>,
    invocations: Mutex<Vec<EngineInvocation>>,
}

impl ScriptedSupervisor {
    pub fn exiting_with(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_to_start() -> Self {
        Self {
            exit_code: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<EngineInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessSupervisor for ScriptedSupervisor {
    async fn run(&self, invocation: &EngineInvocation) -> Result<i32> {
        self.invocations.lock().unwrap().push(invocation.clone());
        self.exit_code
            .ok_or_else(|| anyhow!("failed to start: {}", invocation.command.program()))
    }
}
