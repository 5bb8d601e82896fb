//! edge-agent daemon entry point.

use log::{error, info};
use tokio::signal;

use edge_agent::apply::Capabilities;
use edge_agent::{Config, Manager};

#[cfg(unix)]
async fn shutdown_signal() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!("Unable to listen for SIGTERM: {}", err);
            return ctrl_c().await;
        }
    };
    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load and validate configuration
    let mut cfg = Config::load()?;
    if let Err(e) = cfg.validate() {
        error!("Invalid configuration: {}", e);
        anyhow::bail!("invalid configuration: {}", e);
    }
    info!("Starting edge-agent with config: {:?}", cfg);

    // Collaborators
    let caps = Capabilities::state_files(&cfg.workdir, &cfg.dns);

    let mut manager = Manager::new(cfg, caps).await?;
    manager.start().await?;

    // Graceful Shutdown
    shutdown_signal().await;
    manager.stop().await;

    info!("Shutdown complete.");
    Ok(())
}
