//! Agorum coordination runtime - process entry point.

use std::sync::Arc;

use agorum::config::CoordinatorConfig;
use agorum::coordinator::Coordinator;
use agorum::server::{serve_with_graceful_shutdown, start_server};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("agorum=info".parse()?))
        .init();

    let config = CoordinatorConfig::from_env();
    info!(storage_path = %config.storage_path.display(), "starting agorum coordinator");

    let coordinator = Arc::new(Coordinator::build(config).await?);
    coordinator.spawn_background_loops();
    coordinator.spawn_persistence_bridge();

    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);
    let (listener, addr, router) = start_server(Arc::clone(&coordinator), port).await.map_err(|error| anyhow::anyhow!(error.to_string()))?;
    info!(%addr, "chat API listening");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    serve_with_graceful_shutdown(listener, router, shutdown).await?;
    coordinator.shutdown();
    info!("agorum coordinator shut down gracefully");
    Ok(())
}
