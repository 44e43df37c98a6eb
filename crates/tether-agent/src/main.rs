//! tether-agent: in-sandbox agent for the tether bridge.
//!
//! Dials the host daemon's control socket and keeps the connection
//! alive with exponential backoff, serving forwards, tunnels, and
//! session telemetry. All protocol I/O runs on one dedicated loop
//! thread.

use clap::Parser;
use std::path::PathBuf;
use tether_agent::config::AgentConfig;
use tether_agent::connector::Connector;
use tether_core::ProtocolRuntime;
use tracing::{error, info};

/// tether-agent — sandbox bridge agent
#[derive(Parser, Debug)]
#[command(name = "tether-agent", version, about = "Sandbox bridge agent")]
struct Cli {
    /// Host control socket path
    #[arg(short, long)]
    socket: Option<String>,

    /// Identity reported in the hello handshake (defaults to $HOSTNAME)
    #[arg(short, long)]
    identity: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.tether/agent.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tether-agent");

    let runtime = match ProtocolRuntime::new("tether-agent-loop") {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start protocol loop");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(Ok(())) => info!("tether-agent stopped"),
        Ok(Err(e)) => {
            error!(error = %e, "agent error");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "protocol loop error");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(
        Some(&config_path),
        cli.socket.as_deref(),
        cli.identity.as_deref(),
    )?;

    let connector = Connector::new(config);
    tokio::select! {
        _ = connector.run() => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }
    Ok(())
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
