//! Applying rule sets to stored crawls.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use super::matcher::Matcher;
use super::rules::RuleSet;
use crate::domains::crawls::models::{Crawl, Project};
use crate::kernel::jobs::{Job, JobLogLevel};
use crate::kernel::partitions;

/// Pages updated per committed transaction.
pub const PAGE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorizationReport {
    pub crawl_id: i32,
    pub categories: usize,
    pub pages: usize,
    pub categorized: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub crawls: usize,
    pub categorized_crawls: usize,
    pub failed_crawls: usize,
    pub categorized_pages: usize,
}

/// Rule document for a crawl: its project's document, else the crawl's own.
pub async fn rules_for_crawl(crawl: &Crawl, pool: &PgPool) -> Result<Option<String>> {
    if let Some(project_id) = crawl.project_id {
        let project_rules = Project::find_by_id(project_id, pool)
            .await?
            .and_then(|project| project.categorization_config)
            .filter(|document| !document.trim().is_empty());
        if project_rules.is_some() {
            return Ok(project_rules);
        }
    }

    Ok(Crawl::categorization_rules(crawl.id, pool)
        .await?
        .filter(|document| !document.trim().is_empty()))
}

/// Rebuild the categories of a crawl and assign every page to one.
///
/// Returns `None` when the crawl has no rules. Category rows are replaced in
/// one transaction; page assignments are committed in batches of
/// [`PAGE_BATCH_SIZE`] so a large crawl never holds locks for long.
pub async fn categorize_crawl(crawl_id: i32, pool: &PgPool) -> Result<Option<CategorizationReport>> {
    let crawl = Crawl::find_by_id(crawl_id, pool)
        .await?
        .with_context(|| format!("Crawl {} not found", crawl_id))?;

    let Some(document) = rules_for_crawl(&crawl, pool).await? else {
        info!(crawl_id, "no categorization rules, skipping");
        return Ok(None);
    };

    let rules = RuleSet::parse(&document)?;
    let matcher = Matcher::compile(&rules);

    partitions::ensure_partitions(pool, crawl_id).await?;
    let category_ids = replace_categories(crawl_id, &matcher, pool).await?;

    let pages = sqlx::query_as::<_, (String, String)>(
        "SELECT id, url FROM pages WHERE crawl_id = $1 ORDER BY id",
    )
    .bind(crawl_id)
    .fetch_all(pool)
    .await
    .context("Failed to load pages")?;

    let mut categorized = 0;
    for batch in pages.chunks(PAGE_BATCH_SIZE) {
        let mut tx = pool.begin().await?;
        for (page_id, url) in batch {
            let cat_id = matcher
                .classify(url)
                .rule_name()
                .and_then(|name| category_ids.get(name).copied());
            if cat_id.is_some() {
                categorized += 1;
            }

            sqlx::query("UPDATE pages SET cat_id = $3 WHERE crawl_id = $1 AND id = $2")
                .bind(crawl_id)
                .bind(page_id)
                .bind(cat_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.context("Failed to commit page categories")?;
    }

    let report = CategorizationReport {
        crawl_id,
        categories: category_ids.len(),
        pages: pages.len(),
        categorized,
    };
    info!(
        crawl_id,
        categories = report.categories,
        pages = report.pages,
        categorized = report.categorized,
        "crawl categorized"
    );

    Ok(Some(report))
}

async fn replace_categories(
    crawl_id: i32,
    matcher: &Matcher,
    pool: &PgPool,
) -> Result<HashMap<String, i32>> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM categories WHERE crawl_id = $1")
        .bind(crawl_id)
        .execute(&mut *tx)
        .await?;

    let mut ids = HashMap::new();
    for (name, color) in matcher.categories() {
        let id = sqlx::query_scalar::<_, i32>(
            "INSERT INTO categories (crawl_id, cat, color) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(crawl_id)
        .bind(name)
        .bind(color)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert category {}", name))?;
        ids.insert(name.to_string(), id);
    }

    tx.commit().await?;
    Ok(ids)
}

/// Apply a project's rules to every one of its crawls.
///
/// The project document is also stored as each crawl's own rule document.
/// A crawl that fails is logged and counted; the rest still run. With a
/// `job_id`, progress and log lines are written to that job.
pub async fn batch_categorize_project(
    project_id: i32,
    job_id: Option<i64>,
    pool: &PgPool,
) -> Result<BatchReport> {
    let project = Project::find_by_id(project_id, pool)
        .await?
        .with_context(|| format!("Project {} not found", project_id))?;
    let document = project
        .categorization_config
        .filter(|document| !document.trim().is_empty())
        .with_context(|| format!("Project {} has no categorization rules", project_id))?;

    // Reject a broken document before touching any crawl.
    RuleSet::parse(&document)?;

    let crawls = Crawl::find_by_project(project_id, pool).await?;
    let mut report = BatchReport {
        crawls: crawls.len(),
        ..Default::default()
    };

    if let Some(job_id) = job_id {
        let message = format!("Categorizing {} crawls of project {}", crawls.len(), project.name);
        Job::add_log(job_id, &message, JobLogLevel::Info, pool).await?;
    }

    for (done, crawl) in crawls.iter().enumerate() {
        let result = async {
            Crawl::save_categorization_rules(crawl.id, &document, pool).await?;
            categorize_crawl(crawl.id, pool).await
        }
        .await;

        match result {
            Ok(Some(crawl_report)) => {
                report.categorized_crawls += 1;
                report.categorized_pages += crawl_report.categorized;
            }
            Ok(None) => {}
            Err(e) => {
                report.failed_crawls += 1;
                warn!(crawl_id = crawl.id, error = %format!("{:#}", e), "crawl categorization failed");
                if let Some(job_id) = job_id {
                    let message = format!("Crawl {} failed: {:#}", crawl.path, e);
                    Job::add_log(job_id, &message, JobLogLevel::Error, pool).await?;
                }
            }
        }

        if let Some(job_id) = job_id {
            let progress = ((done + 1) * 100 / crawls.len()) as i32;
            Job::update_progress(job_id, progress, pool).await?;
        }
    }

    if let Some(job_id) = job_id {
        let (message, level) = if report.failed_crawls == 0 {
            (
                format!(
                    "Categorized {} pages across {} crawls",
                    report.categorized_pages, report.categorized_crawls
                ),
                JobLogLevel::Success,
            )
        } else {
            (
                format!(
                    "{} of {} crawls failed to categorize",
                    report.failed_crawls, report.crawls
                ),
                JobLogLevel::Warning,
            )
        };
        Job::add_log(job_id, &message, level, pool).await?;
    }

    info!(
        project_id,
        crawls = report.crawls,
        failed = report.failed_crawls,
        pages = report.categorized_pages,
        "project categorized"
    );

    Ok(report)
}
