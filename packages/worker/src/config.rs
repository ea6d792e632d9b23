use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub max_concurrent_curl: u32,
    pub max_concurrent_chrome: u32,
    pub renderer_url: String,
    /// Program and leading arguments of the crawl engine, e.g. `php scouter.php`
    pub engine_command: Vec<String>,
    pub engine_workdir: PathBuf,
    pub logs_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
    pub heartbeat_every_polls: u64,
    pub recover_orphans: bool,
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let worker_id = env::var("WORKER_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("worker-{}", std::process::id()));

        let engine_command: Vec<String> = env::var("ENGINE_COMMAND")
            .unwrap_or_else(|_| "/usr/local/bin/php scouter.php".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if engine_command.is_empty() {
            anyhow::bail!("ENGINE_COMMAND must not be empty");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id,
            max_concurrent_curl: parse_var("MAX_CONCURRENT_CURL", 10)?,
            max_concurrent_chrome: parse_var("MAX_CONCURRENT_CHROME", 5)?,
            renderer_url: env::var("RENDERER_URL")
                .unwrap_or_else(|_| "http://renderer:3000".to_string()),
            engine_command,
            engine_workdir: env::var("ENGINE_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            logs_dir: env::var("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SECS", 2)?),
            max_consecutive_errors: parse_var("MAX_CONSECUTIVE_ERRORS", 10)?,
            heartbeat_every_polls: parse_var("HEARTBEAT_EVERY_POLLS", 100)?,
            recover_orphans: parse_flag("RECOVER_ORPHANS", true),
            run_migrations: parse_flag("RUN_MIGRATIONS", true),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
