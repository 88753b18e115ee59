//! burrow: expose a local TCP service through a burrow broker.
//!
//! Dials the broker, prints the public address users can hit, and relays
//! until interrupted.

use burrow_agent::Tunnel;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};

/// burrow: tunnel agent
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "Expose a local TCP service through a burrow broker")]
struct Cli {
    /// Local port of the protected service
    protected_port: u16,

    /// Broker address as host:port
    broker: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(port = cli.protected_port, broker = %cli.broker, "opening tunnel");
    let tunnel = match Tunnel::open(cli.protected_port, cli.broker.as_str()).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            error!(error = %e, "unable to open tunnel");
            std::process::exit(2);
        }
    };

    // The public address users hit to reach the protected service.
    let broker_host = cli
        .broker
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(cli.broker.as_str());
    println!("{}:{}", broker_host, tunnel.public_port());

    shutdown_signal().await;
    info!("received shutdown signal");
    tunnel.stop().await;
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
