//! Background worker for the moderation engine.
//!
//! Approvals and submissions queue tasks in the `moderation_tasks` table;
//! this crate claims and runs them:
//!
//! - `post_approval`: re-check the quorum, apply the change or its change
//!   set, announce the result.
//! - `notify_moderators` / `notify_verdict`: best-effort email.
//!
//! Host applications register their moderated entities, then hand the
//! registry to the worker:
//!
//! ```no_run
//! # async fn start(registry: std::sync::Arc<modhist_db::registry::EntityRegistry>)
//! #     -> Result<(), modhist_worker::WorkerError> {
//! use modhist_worker::{WorkerConfig, WorkerContext};
//!
//! modhist_worker::init_tracing();
//! let config = WorkerConfig::from_env()?;
//! let pool = modhist_worker::connect(&config).await?;
//! modhist_worker::run_until_shutdown(WorkerContext::new(pool, registry, config)).await;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use modhist_db::DbPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod runner;

pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use error::WorkerError;
pub use runner::Worker;

/// How long shutdown waits for an in-flight task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modhist_worker=debug,modhist_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect, check and migrate the database.
pub async fn connect(config: &WorkerConfig) -> Result<DbPool, WorkerError> {
    let pool = modhist_db::create_pool(&config.database_url).await?;
    tracing::info!("Database connection pool created");

    modhist_db::health_check(&pool).await?;
    tracing::info!("Database health check passed");

    modhist_db::run_migrations(&pool)
        .await
        .map_err(|e| WorkerError::Migration(e.to_string()))?;
    tracing::info!("Database migrations applied");
    Ok(pool)
}

/// Run a worker until SIGINT or SIGTERM, then let the current task finish.
pub async fn run_until_shutdown(ctx: WorkerContext) {
    let cancel = CancellationToken::new();
    let worker = Worker::new(ctx);
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    shutdown_signal().await;
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
        tracing::warn!("Worker did not stop within the grace period");
    }
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
