//! `projector`: runs the membership projections until interrupted.

use anyhow::Context;
use projector_postgres::PostgresEventStore;
use projector_projections::{PostgresProjectionStorage, ServiceConfig, register_membership};
use projector_runtime::ProjectionHost;
use projector_runtime::metrics::MetricsServer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "projector=info,projector_runtime=info,projector_projections=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        worker_id = %config.runner.worker_id,
        batch_size = config.runner.batch_size,
        "Starting projector"
    );

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("Failed to start metrics server")?;
    }

    let events = PostgresEventStore::new(&config.eventstore_database_url)
        .await
        .context("Failed to connect to the event store")?;
    let storage = Arc::new(
        PostgresProjectionStorage::connect(&config.database_url)
            .await
            .context("Failed to connect to the projection database")?,
    );

    let mut host = ProjectionHost::new(Arc::new(events), storage.clone(), config.runner);
    register_membership(&mut host, storage)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = host.start(shutdown_rx).await?;
    tracing::info!(projections = ?running.projections(), "Projections running");

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
        shutdown_tx.send(true).ok();
    });

    running.wait().await?;
    tracing::info!("Projector stopped");
    Ok(())
}
