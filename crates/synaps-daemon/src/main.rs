//! synapsd - device-management daemon

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use libsynaps_ipc::ServerShape;
use synaps_daemon::{DaemonError, Orchestrator, Settings};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "synapsd", about = "Sensor and relay management daemon", version)]
struct Cli {
    /// Directory searched for configuration files before the default locations
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory holding the API endpoint sockets
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// API server implementation (async, blocking)
    #[arg(long, default_value_t = ServerShape::Async)]
    server_shape: ServerShape,

    /// Bound on closing a single device or sink, in seconds
    #[arg(long, default_value = "10")]
    unit_timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("synapsd starting");

    let mut settings = Settings::from_env();
    if let Some(dir) = cli.config_dir {
        settings = settings.with_config_dir(dir);
    }
    if let Some(dir) = cli.runtime_dir {
        settings.runtime_dir = dir;
    }
    settings.server_shape = cli.server_shape;
    settings.unit_timeout = Duration::from_secs(cli.unit_timeout);

    let orchestrator = Orchestrator::new(settings);
    match orchestrator.run(shutdown_signal()).await {
        Ok(()) => {
            info!("synapsd stopped");
            ExitCode::SUCCESS
        }
        Err(DaemonError::AlreadyRunning) => {
            warn!("Another instance is serving this runtime directory, exiting");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "synapsd failed");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
