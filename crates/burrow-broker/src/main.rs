//! burrow-broker: public rendezvous point for burrow tunnels.
//!
//! Listens for agent control connections, allocates one public port per
//! agent, and bridges user connections to the tunneled service.

use burrow_broker::{Broker, BrokerConfig};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// burrow-broker: tunnel rendezvous point
#[derive(Parser, Debug)]
#[command(name = "burrow-broker", version, about = "burrow tunnel broker")]
struct Cli {
    /// IP address to bind the agent control listener on (default 0.0.0.0)
    bind_ip: Option<IpAddr>,

    /// Control port agents dial
    #[arg(long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting burrow-broker");

    let config = match BrokerConfig::load(cli.config.as_deref(), cli.bind_ip, cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let broker = match Broker::start(config).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    };
    info!(addr = %broker.local_addr(), "broker running");

    shutdown_signal().await;
    info!("received shutdown signal");
    broker.stop().await;
    info!("burrow-broker stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
