use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clinisync::api::RestApi;
use clinisync::config::load_config;
use clinisync::engine::MonitoringEngine;
use clinisync::sync::{HttpTransport, LogNotifier};
use clinisync::EngineResult;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clinisync=info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Clinisync exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> EngineResult<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let config = load_config(&path)?;
    info!(config = %path.display(), upstream = %config.upstream.base_url, "Starting Clinisync");

    let transport = Arc::new(HttpTransport::new(&config.upstream)?);
    let engine = Arc::new(MonitoringEngine::new(&config, transport, Arc::new(LogNotifier)));
    let api = RestApi::new(Arc::clone(&engine));

    // Create a channel for shutdown signal
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let (addr, server) = warp::serve(api.routes()).try_bind_with_graceful_shutdown(
        config.api.socket_addr()?,
        async move {
            shutdown_rx.await.ok();
            info!("Shutting down server");
        },
    )?;
    info!(%addr, "Listening");

    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");

    shutdown_tx.send(()).ok();
    server_handle.await?;

    // Stop polling only after in-flight requests have drained.
    api.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
