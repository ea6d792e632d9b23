//! Operator CLI for the crawl job queue
//!
//! Queue and stop jobs, recover after a crash, and run or preview URL
//! categorization. Batch categorization is also the entry point workers call
//! for `batch-categorize-project:<id>` jobs when this binary is the engine.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::domains::categorization::{self, Matcher, RuleSet};
use worker_core::kernel::jobs::{Job, JobLog, BATCH_CATEGORIZE_PREFIX};
use worker_core::kernel::{db, partitions};
use worker_core::Config;

#[derive(Parser)]
#[command(name = "scouter-admin")]
#[command(about = "Crawl job queue administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Queue a job for a project
    Enqueue {
        project_dir: String,
        /// Display name; defaults to the project directory
        #[arg(long)]
        name: Option<String>,
        /// crawl, resume or batch-categorize-project:<id>
        #[arg(long, default_value = "crawl")]
        command: String,
    },

    /// Ask a job to stop
    Stop { job_id: i64 },

    /// Show a job and its log
    Status { job_id: i64 },

    /// Stop every queued, running or stopping job
    ResetJobs,

    /// Requeue jobs left running by a dead worker
    RecoverOrphans,

    /// Categorize every crawl of a project (`<id>` or `batch-categorize-project:<id>`)
    BatchCategorizeProject { project: String },

    /// Categorize a single crawl
    Categorize { crawl_id: i32 },

    /// Create (or with --drop, remove) the partitions of a crawl
    Partitions {
        crawl_id: i32,
        #[arg(long)]
        drop: bool,
    },

    /// Classify URLs against a rule file; reads URLs from stdin when none are given
    TestRules { rules: PathBuf, urls: Vec<String> },
}

#[derive(Serialize)]
struct JobStatusOutput {
    job: Job,
    logs: Vec<JobLog>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,worker_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    if let Commands::TestRules { rules, urls } = &cli.command {
        return test_rules(rules, urls);
    }

    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = db::connect(&config.database_url, 2).await?;

    match cli.command {
        Commands::Migrate => {
            db::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Enqueue {
            project_dir,
            name,
            command,
        } => {
            let name = name.unwrap_or_else(|| project_dir.clone());
            let job = Job::enqueue(&project_dir, &name, &command, &pool).await?;
            print_json(&job)?;
        }
        Commands::Stop { job_id } => match Job::request_stop(job_id, &pool).await? {
            Some(status) => println!("job {} is now {}", job_id, status),
            None => anyhow::bail!("job {} is not queued or running", job_id),
        },
        Commands::Status { job_id } => {
            let job = Job::find_by_id(job_id, &pool)
                .await?
                .with_context(|| format!("Job {} not found", job_id))?;
            let logs = Job::logs(job_id, &pool).await?;
            print_json(&JobStatusOutput { job, logs })?;
        }
        Commands::ResetJobs => {
            let reset = Job::reset_stuck(&pool).await?;
            for job in &reset {
                println!("stopped job {} ({})", job.id, job.project_dir);
            }
            println!("{} jobs reset", reset.len());
        }
        Commands::RecoverOrphans => {
            let recovered = Job::recover_orphans(&pool).await?;
            println!(
                "{} jobs re-queued, {} jobs stopped",
                recovered.requeued.len(),
                recovered.stopped.len()
            );
        }
        Commands::BatchCategorizeProject { project } => {
            let project_id = parse_project_id(&project)?;
            let job_id = std::env::var("JOB_ID").ok().and_then(|id| id.parse().ok());
            let report = categorization::batch_categorize_project(project_id, job_id, &pool).await?;
            println!(
                "{} of {} crawls categorized, {} pages assigned",
                report.categorized_crawls, report.crawls, report.categorized_pages
            );
            if report.failed_crawls > 0 {
                anyhow::bail!("{} crawls failed to categorize", report.failed_crawls);
            }
        }
        Commands::Categorize { crawl_id } => {
            match categorization::categorize_crawl(crawl_id, &pool).await? {
                Some(report) => println!(
                    "{} of {} pages categorized into {} categories",
                    report.categorized, report.pages, report.categories
                ),
                None => println!("crawl {} has no categorization rules", crawl_id),
            }
        }
        Commands::Partitions { crawl_id, drop } => {
            if drop {
                partitions::drop_partitions(&pool, crawl_id).await?;
            } else {
                partitions::ensure_partitions(&pool, crawl_id).await?;
            }
            let count = partitions::partition_count(&pool, crawl_id).await?;
            println!("crawl {} has {} partitions", crawl_id, count);
        }
        Commands::TestRules { .. } => {}
    }

    pool.close().await;
    Ok(())
}

fn parse_project_id(raw: &str) -> Result<i32> {
    let id = raw.strip_prefix(BATCH_CATEGORIZE_PREFIX).unwrap_or(raw);
    id.trim()
        .parse()
        .with_context(|| format!("Invalid project id '{}'", raw))
}

fn test_rules(path: &Path, urls: &[String]) -> Result<()> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let rules = RuleSet::parse(&document)?;
    let matcher = Matcher::compile(&rules);

    for skipped in rules.skipped() {
        eprintln!("skipped rule '{}': {}", skipped.name, skipped.reason);
    }
    for invalid in matcher.invalid_patterns() {
        eprintln!(
            "skipped pattern '{}' in '{}': {}",
            invalid.pattern, invalid.category, invalid.error
        );
    }

    let classify = |url: &str| println!("{}\t{}", matcher.classify(url).name(), url);

    if urls.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = line?;
            if !line.trim().is_empty() {
                classify(line.trim());
            }
        }
    } else {
        urls.iter().for_each(|url| classify(url));
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
