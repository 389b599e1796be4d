// caster: Bi-Kanpe client. Receives directives from the hub, filters them by
// displayed monitors, and serves the loopback bridge API.

use caster::{Caster, ReconnectPolicy, config};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "caster", about = "Bi-Kanpe caster client", version)]
struct Args {
    /// Path to the TOML config file (default: /etc/bi-kanpe/caster.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hub address override, e.g. 192.168.1.10:9876.
    #[arg(long)]
    server: Option<String>,
    /// Client name override.
    #[arg(long)]
    name: Option<String>,
    /// Comma-separated monitor IDs to display.
    #[arg(long, value_delimiter = ',')]
    monitors: Option<Vec<String>>,
    /// Disable the loopback bridge API.
    #[arg(long)]
    no_bridge: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg = match args.config {
        Some(path) => config::load_config_from_path(&path),
        None => config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let server_address = args.server.unwrap_or(cfg.session.server_address);
    let client_name = args.name.unwrap_or(cfg.client_name);
    let display_monitor_ids = args.monitors.unwrap_or(cfg.session.display_monitor_ids);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        client_name = %client_name,
        "caster starting"
    );

    let caster = Caster::new(ReconnectPolicy {
        auto_reconnect: cfg.session.auto_reconnect,
        initial_backoff: cfg.session.initial_backoff,
        max_backoff: cfg.session.max_backoff,
    });
    caster
        .connect(&server_address, &client_name, display_monitor_ids)
        .await;

    if cfg.bridge.enabled && !args.no_bridge {
        match caster.start_bridge(cfg.bridge.port).await {
            Ok(port) => info!(port, "bridge available for local tooling"),
            Err(e) => {
                eprintln!("FATAL: {e}");
                std::process::exit(1);
            }
        }
    }

    shutdown_signal().await;
    caster.stop_bridge().await;
    caster.disconnect().await;
    info!("caster shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
