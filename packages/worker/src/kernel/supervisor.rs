//! Crawl engine subprocess supervision.
//!
//! The worker runs one engine process at a time and blocks until it exits.
//! The child gets a minimal, explicit environment and appends its stdout and
//! stderr to the project's log file, so operators can follow a crawl with
//! `tail -f logs/<project>.log`.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::Config;
use crate::kernel::jobs::{Job, JobCommand};

/// Exit code reported when the process could not be started or was killed by
/// a signal.
pub const ABNORMAL_EXIT_CODE: i32 = 1;

/// Fluent builder for the engine command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Value of an environment variable set on the child, if any.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build_command(&self, log: &File) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        // Only what we set explicitly reaches the child.
        cmd.env_clear();
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?));
        Ok(cmd)
    }

    /// Run to completion with output appended to `log_path`.
    ///
    /// Returns the exit code. Termination by a signal reports
    /// [`ABNORMAL_EXIT_CODE`]. Errors only if the process could not be
    /// started.
    pub async fn run_logged(&self, log_path: &Path) -> Result<i32> {
        let log = open_log(log_path).await?.into_std().await;
        let mut cmd = self.build_command(&log)?;

        let status = cmd
            .status()
            .await
            .with_context(|| format!("failed to start: {}", self.display()))?;

        Ok(status.code().unwrap_or(ABNORMAL_EXIT_CODE))
    }
}

/// Banner written to the project log before the engine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMarker {
    Crawl,
    Resume,
    BatchCategorize,
}

impl StartMarker {
    pub fn for_command(command: &JobCommand) -> Self {
        match command {
            JobCommand::Crawl => StartMarker::Crawl,
            JobCommand::Resume => StartMarker::Resume,
            JobCommand::BatchCategorize { .. } => StartMarker::BatchCategorize,
        }
    }

    pub fn banner(&self) -> &'static str {
        match self {
            StartMarker::Crawl => "=== WORKER STARTED CRAWL ===",
            StartMarker::Resume => "=== WORKER RESUMED CRAWL ===",
            StartMarker::BatchCategorize => "=== WORKER STARTED BATCH CATEGORIZE ===",
        }
    }

    /// Line for the job's own log table.
    pub fn job_log_message(&self, worker_id: &str) -> String {
        match self {
            StartMarker::Crawl => format!("Worker {} starting crawl", worker_id),
            StartMarker::Resume => format!("Worker {} resuming crawl", worker_id),
            StartMarker::BatchCategorize => {
                format!("Worker {} starting batch categorization", worker_id)
            }
        }
    }

    pub async fn write(&self, log_path: &Path, job_id: i64) -> Result<()> {
        let entry = format!(
            "\n{}\nJob ID: {}\nTime: {}\n\n",
            self.banner(),
            job_id,
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );

        let mut log = open_log(log_path).await?;
        log.write_all(entry.as_bytes())
            .await
            .with_context(|| format!("Failed to write to {}", log_path.display()))?;
        log.flush().await?;
        Ok(())
    }
}

async fn open_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// A fully resolved engine run for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub job_id: i64,
    pub command: EngineCommand,
    pub log_path: PathBuf,
    pub marker: StartMarker,
}

/// Static engine settings, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub program: String,
    pub leading_args: Vec<String>,
    pub workdir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_url: String,
    pub max_concurrent_curl: u32,
    pub max_concurrent_chrome: u32,
    pub renderer_url: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut command = config.engine_command.iter().cloned();
        let program = command.next().unwrap_or_default();

        Self {
            program,
            leading_args: command.collect(),
            workdir: config.engine_workdir.clone(),
            logs_dir: config.logs_dir.clone(),
            database_url: config.database_url.clone(),
            max_concurrent_curl: config.max_concurrent_curl,
            max_concurrent_chrome: config.max_concurrent_chrome,
            renderer_url: config.renderer_url.clone(),
        }
    }

    /// `<logs_dir>/<project_dir>.log`. Components that would escape the logs
    /// directory are dropped.
    pub fn log_path_for(&self, project_dir: &str) -> PathBuf {
        let relative: PathBuf = Path::new(project_dir)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let mut file_name = relative.into_os_string();
        file_name.push(".log");
        self.logs_dir.join(file_name)
    }

    pub fn invocation_for(&self, job: &Job) -> EngineInvocation {
        let kind = job.kind();

        let mut command = EngineCommand::new(&self.program)
            .args(self.leading_args.iter().cloned())
            .cwd(&self.workdir)
            .env("DATABASE_URL", &self.database_url)
            .env("MAX_CONCURRENT_CURL", self.max_concurrent_curl.to_string())
            .env("MAX_CONCURRENT_CHROME", self.max_concurrent_chrome.to_string())
            .env("RENDERER_URL", &self.renderer_url);
        if let Ok(path) = std::env::var("PATH") {
            command = command.env("PATH", path);
        }

        command = match &kind {
            JobCommand::Crawl | JobCommand::Resume => command
                .arg("crawl")
                .arg(&job.project_dir)
                // The engine still creates partitions itself if this is wrong.
                .env("PARTITIONS_CREATED", "1"),
            JobCommand::BatchCategorize { argument } => command
                .arg("batch-categorize-project")
                .arg(argument)
                .env("JOB_ID", job.id.to_string()),
        };

        EngineInvocation {
            job_id: job.id,
            command,
            log_path: self.log_path_for(&job.project_dir),
            marker: StartMarker::for_command(&kind),
        }
    }
}

/// Runs engine invocations to completion.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Run and wait. Returns the exit code; failing to start is an error.
    async fn run(&self, invocation: &EngineInvocation) -> Result<i32>;
}

/// Writes the start banner to the project log, then runs the engine with its
/// output appended to the same file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggedSupervisor;

#[async_trait]
impl ProcessSupervisor for LoggedSupervisor {
    async fn run(&self, invocation: &EngineInvocation) -> Result<i32> {
        invocation
            .marker
            .write(&invocation.log_path, invocation.job_id)
            .await?;
        invocation.command.run_logged(&invocation.log_path).await
    }
}
