use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use termrelay_server::config::ServerConfig;
use termrelay_server::server::RelayServer;

#[derive(Parser, Debug)]
#[command(
    name = "termrelay-server",
    about = "Multi-client terminal relay server",
    version
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds a session may sit idle before it is destroyed
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Path to the persisted session state file
    #[arg(long)]
    state_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match ServerConfig::load(
        cli.config.as_deref(),
        cli.port,
        cli.max_sessions,
        cli.idle_timeout,
        cli.sweep_interval,
        cli.state_file.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        port = config.port,
        max_sessions = config.max_sessions,
        "starting termrelay-server"
    );

    let server = Arc::new(RelayServer::new(config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    server.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
