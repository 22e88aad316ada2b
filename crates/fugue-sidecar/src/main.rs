//! fugue-sidecar binary.
//!
//! # Usage
//!
//! ```text
//! fugue-sidecar --brokers localhost:4222 --inputs numbers --outputs squares \
//!     --group squarer --protocol http --port 8080
//! ```

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

use fugue_sidecar::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fugue_sidecar=debug".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    // Trap SIGINT and SIGTERM to trigger a shutdown.
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    fugue_sidecar::run(config, shutdown_rx).await?;
    Ok(())
}
