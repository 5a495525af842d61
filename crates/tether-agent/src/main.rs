#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tether_agent::config::{AgentConfig, Args};
use tether_agent::{builtin, metrics, run_with_shutdown, AgentState};
use tether_common::SessionKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config: AgentConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let session_key = match &config.session_key {
        Some(path) => {
            let key = SessionKey::load(path, config.cipher)
                .with_context(|| format!("loading session key from {}", path.display()))?;
            info!(cipher = %config.cipher, "loaded session key from {}", path.display());
            Some(key)
        }
        None => {
            warn!("no session key configured, connections stay plaintext");
            None
        }
    };

    if let Some(addr) = config.metrics_addr {
        metrics::install_exporter(addr)?;
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let state = Arc::new(AgentState::new(config, builtin::registry(), session_key));
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    shutdown.cancel();
    server.await??;

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
