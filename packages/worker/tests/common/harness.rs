//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test in the binary. Each test
//! gets its own freshly migrated database on it, so queue tests never claim
//! each other's jobs.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use worker_core::kernel::db;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();
static NEXT_DATABASE: AtomicUsize = AtomicUsize::new(0);

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=300"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;

        Ok(Self {
            server_url: format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port),
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test database on the shared container.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let job = Job::enqueue("site", "Site", "crawl", &ctx.db_pool).await.unwrap();
/// }
/// ```
pub struct TestHarness {
    /// Pool with the worker session defaults.
    pub db_pool: PgPool,
    /// URL of this test's database, for components that open their own pool.
    pub database_url: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let name = format!(
            "scouter_test_{}_{}",
            std::process::id(),
            NEXT_DATABASE.fetch_add(1, Ordering::SeqCst)
        );

        let admin = PgPool::connect(&format!("{}/postgres", infra.server_url))
            .await
            .context("Failed to connect to test server")?;
        sqlx::query(&format!("CREATE DATABASE {}", name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let database_url = format!("{}/{}", infra.server_url, name);
        let db_pool = db::connect(&database_url, 20).await?;
        db::migrate(&db_pool).await?;

        Ok(Self {
            db_pool,
            database_url,
        })
    }
}
