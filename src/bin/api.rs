//! Control API binary (spec §6).
//!
//! Mirrors `cmd/app/main.go`'s server: loads config, connects the store,
//! serves the HTTP API, shuts down gracefully on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use mitm_proxy::{Config, PgStore};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy-api")]
#[command(about = "Control API for captured request/response data", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).with_context(|| format!("failed to load config from {}", cli.config))?;
    mitm_proxy::logging::init(config.logger.level);

    let store = Arc::new(PgStore::connect(&config.database.connection_string()).await.context("failed to connect to store")?);
    store.migrate().await.context("failed to run store migrations")?;

    let app = mitm_proxy::control_api::router(store);
    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("failed to bind control API on {addr}"))?;
    tracing::info!("control API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
