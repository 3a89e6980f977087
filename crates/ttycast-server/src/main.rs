//! ttycast-server: terminal-streaming session broker.
//!
//! Spawns game workers on a PTY, records their output, and fans it out to a
//! player and any number of spectators over WebSocket.

mod auth;
mod broker;
mod client;
mod config;
mod lobby;
mod server;
mod session;
mod timer;
mod transport;
mod watcher;

use auth::profile::FileProfileStore;
use auth::ConfigCredentials;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::CastServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// ttycast-server: terminal-streaming session broker
#[derive(Parser, Debug)]
#[command(name = "ttycast-server", version, about = "Terminal-streaming session broker")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ttycast/config.toml")]
    config: String,

    /// Pick up worker sockets created outside the server
    #[arg(long)]
    watch_socket_dirs: bool,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ttycast-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_connections: cli.max_connections,
        watch_socket_dirs: cli.watch_socket_dirs,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    if config.games.is_empty() {
        warn!("no games configured");
    }

    let credentials = Arc::new(ConfigCredentials::new(&config.users));
    let profiles = Arc::new(FileProfileStore::new(config.profile_dir.clone()));
    let shutdown_grace = config.session.kill_timeout + Duration::from_secs(5);

    let server = CastServer::new(config, credentials, profiles);
    let handle = server.handle();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    if tokio::time::timeout(shutdown_grace, handle.shutdown())
        .await
        .is_err()
    {
        warn!("sessions still running at exit");
    }
    info!("ttycast-server stopped");
}

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
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
