//! Row fixtures shared by the integration tests.

use sqlx::PgPool;
use worker_core::domains::crawls::models::{Crawl, Project};
use worker_core::kernel::partitions;

/// A project with one crawl at `path`.
pub async fn create_project_with_crawl(
    pool: &PgPool,
    path: &str,
    rules: Option<&str>,
) -> (Project, Crawl) {
    let project = Project::create(path, pool)
        .await
        .expect("Failed to create project");
    if rules.is_some() {
        Project::set_categorization_config(project.id, rules, pool)
            .await
            .expect("Failed to set project rules");
    }
    let crawl = Crawl::create(Some(project.id), path, "example.com", pool)
        .await
        .expect("Failed to create crawl");
    (project, crawl)
}

/// Insert pages for a crawl, creating its partitions first.
pub async fn insert_pages(pool: &PgPool, crawl_id: i32, urls: &[&str]) {
    partitions::ensure_partitions(pool, crawl_id)
        .await
        .expect("Failed to create partitions");

    for (i, url) in urls.iter().enumerate() {
        sqlx::query("INSERT INTO pages (crawl_id, id, url) VALUES ($1, $2, $3)")
            .bind(crawl_id)
            .bind(format!("p{:04}", i))
            .bind(url)
            .execute(pool)
            .await
            .expect("Failed to insert page");
    }
}

/// Category name assigned to a page, if any.
pub async fn page_category(pool: &PgPool, crawl_id: i32, url: &str) -> Option<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT c.cat
         FROM pages p
         JOIN categories c ON c.crawl_id = p.crawl_id AND c.id = p.cat_id
         WHERE p.crawl_id = $1 AND p.url = $2",
    )
    .bind(crawl_id)
    .bind(url)
    .fetch_optional(pool)
    .await
    .expect("Failed to read page category")
}

pub async fn crawl_status(pool: &PgPool, crawl_id: i32) -> (String, bool) {
    sqlx::query_as::<_, (String, bool)>("SELECT status, in_progress FROM crawls WHERE id = $1")
        .bind(crawl_id)
        .fetch_one(pool)
        .await
        .expect("Failed to read crawl status")
}
