//! Proxy binary (spec §6 "CLI flags"): the MITM proxy engine.
//!
//! Mirrors `cmd/proxy/main.go`'s split from the control API binary:
//! dedicated process, own config section, own graceful shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use mitm_proxy::{CertificateAuthority, Config, PgStore, ProxyEngine};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
#[command(about = "Intercepting HTTP/HTTPS proxy with persistent capture", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Path to the root CA certificate (PEM). Required; no auto-generation.
    #[arg(long = "ca_cert_file")]
    ca_cert_file: String,

    /// Path to the root CA private key (PEM). Required; no auto-generation.
    #[arg(long = "ca_key_file")]
    ca_key_file: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).with_context(|| format!("failed to load config from {}", cli.config))?;
    mitm_proxy::logging::init(config.logger.level);

    let ca = Arc::new(CertificateAuthority::load(&cli.ca_cert_file, &cli.ca_key_file).context("failed to load CA")?);

    let store = Arc::new(PgStore::connect(&config.database.connection_string()).await.context("failed to connect to store")?);
    store.migrate().await.context("failed to run store migrations")?;

    let engine = Arc::new(ProxyEngine::new(store, ca).context("failed to build proxy engine")?);

    let shutdown = async {
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
    };

    let addr = config.proxy_addr().parse().with_context(|| format!("invalid proxy address {}", config.proxy_addr()))?;
    engine.run(addr, shutdown).await?;

    Ok(())
}
