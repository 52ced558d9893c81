//! medrelay-server: WebRTC signaling relay for telemedicine consultations.
//!
//! Accepts WebSocket connections, groups them into two-party consultation
//! rooms, and relays offer/answer/ICE messages between the peers. Media
//! never flows through this process.

mod config;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::SignalServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// medrelay-server: consultation signaling relay
#[derive(Parser, Debug)]
#[command(name = "medrelay-server", version, about = "WebRTC signaling relay for telemedicine")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "SIGNALING_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.medrelay/config.toml")]
    config: String,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Liveness probe interval in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting medrelay-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        max_connections: cli.max_connections,
        heartbeat_interval: cli.heartbeat_interval,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = SignalServer::new(server_config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
