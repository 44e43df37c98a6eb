//! tether-host: host-side daemon for the tether bridge.
//!
//! Accepts sandbox agent connections over a Unix control socket and
//! serves forward negotiation, tunnels, notifications, and telemetry.
//! All protocol I/O runs on one dedicated loop thread.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::ProtocolRuntime;
use tether_host::config::HostConfig;
use tether_host::events::LogEvents;
use tether_host::listener::ControlListener;
use tether_host::policy::PolicyEnforcer;
use tether_host::registry::ConnectionRegistry;
use tether_host::usage::UsageTracker;
use tracing::{error, info};

/// tether-host — sandbox bridge daemon
#[derive(Parser, Debug)]
#[command(name = "tether-host", version, about = "Sandbox bridge daemon")]
struct Cli {
    /// Control socket path
    #[arg(short, long)]
    socket: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.tether/config.toml")]
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

    info!(version = env!("CARGO_PKG_VERSION"), "starting tether-host");

    let runtime = match ProtocolRuntime::new("tether-host-loop") {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start protocol loop");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(Ok(())) => info!("tether-host stopped"),
        Ok(Err(e)) => {
            error!(error = %e, "daemon error");
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
    let config = HostConfig::load(Some(&config_path), cli.socket.as_deref())?;

    let registry = ConnectionRegistry::new();
    let policy = Arc::new(PolicyEnforcer::new(config.policy.clone()));
    let usage = Arc::new(UsageTracker::new());
    let events = Arc::new(LogEvents);

    let listener = ControlListener::bind(&config.socket_path, registry, policy, usage, events)?;

    tokio::select! {
        _ = listener.run() => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Leave no stale socket behind for the next start to trip over.
    let _ = std::fs::remove_file(listener.socket_path());
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
