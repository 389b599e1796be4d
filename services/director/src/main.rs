// director: Bi-Kanpe hub. Accepts caster connections and fans out directives.

use clap::Parser;
use director::{Director, config};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "director", about = "Bi-Kanpe director hub", version)]
struct Args {
    /// Path to the TOML config file (default: /etc/bi-kanpe/director.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,
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
    let port = args.port.unwrap_or(cfg.port);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_name = %cfg.hub.server_name,
        "director starting"
    );

    let director = Director::new(cfg.hub);
    let bound = match director.start(port).await {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    info!(port = bound, "director listening");

    shutdown_signal().await;
    director.stop().await;
    info!("director shut down gracefully");
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
