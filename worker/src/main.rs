//! Cart expiration worker.
//!
//! Periodically expires idle carts and frees their product reservations.
//!
//! # Environment
//!
//! `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`, `REDIS_URL`, `PRODUCT_SERVICE_URL`,
//! `PRODUCT_SERVICE_TIMEOUT_MS`, `CART_TTL_SECONDS`, `SWEEP_INTERVAL_SECONDS`,
//! `METRICS_ADDR`, `RUST_LOG`. A `.env` file is honoured.

use anyhow::Context;
use cartkeeper_runtime::metrics::MetricsServer;
use cartkeeper_worker::{Config, Resources, init_tracing};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config.log_level);

    info!(
        cart_ttl_seconds = config.carts.ttl.num_seconds(),
        sweep_interval_seconds = config.carts.sweep_interval.as_secs(),
        "Starting cart expiration worker"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    let resources = Resources::connect(&config).await?;
    let sweeper = resources.sweeper();

    sweeper
        .run(config.carts.sweep_interval, shutdown_signal())
        .await;

    info!("Worker stopped");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (in production environments)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
