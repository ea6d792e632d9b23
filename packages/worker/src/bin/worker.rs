// Crawl worker entry point
//
// Run one per container; scale by running more containers. Exits with status 1
// when the loop gives up so the orchestrator restarts it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::kernel::db;
use worker_core::kernel::jobs::{JobWorker, JobWorkerConfig, PostgresJobStore};
use worker_core::kernel::supervisor::{EngineSettings, LoggedSupervisor};
use worker_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        worker_id = %config.worker_id,
        max_concurrent_curl = config.max_concurrent_curl,
        max_concurrent_chrome = config.max_concurrent_chrome,
        engine = %config.engine_command.join(" "),
        "starting crawl worker"
    );

    let store = match PostgresJobStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %format!("{:#}", e), "cannot reach database, exiting");
            std::process::exit(1);
        }
    };
    info!("database connected");

    if config.run_migrations {
        db::migrate(&store.pool().await).await?;
        info!("migrations complete");
    }

    if config.recover_orphans {
        match store.recover_orphans().await {
            Ok(recovered) if recovered.is_empty() => {}
            Ok(recovered) => warn!(
                requeued = recovered.requeued.len(),
                stopped = recovered.stopped.len(),
                "recovered jobs orphaned by a previous worker"
            ),
            Err(e) => warn!(error = %format!("{:#}", e), "orphan recovery failed"),
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let worker = JobWorker::new(
        Arc::new(store),
        Arc::new(LoggedSupervisor),
        EngineSettings::from_config(&config),
        JobWorkerConfig::from_config(&config),
    );

    if let Err(e) = worker.run(shutdown).await {
        error!(error = %e, "worker stopped");
        std::process::exit(1);
    }

    info!("worker shut down cleanly");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("received shutdown signal, finishing current job");
    shutdown.cancel();
}
