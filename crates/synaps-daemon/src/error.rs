//! Daemon error types

use libsynaps_core::CoreError;
use libsynaps_ipc::IpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    /// Another instance answers on the runtime directory
    #[error("Service is already running")]
    AlreadyRunning,

    /// API endpoint could not be started
    #[error("API not started: {0}")]
    ApiNotStarted(#[source] IpcError),

    /// At least one initialisation branch failed
    #[error("Service not started")]
    ServiceNotStarted,

    /// Every shutdown branch ran, some failed
    #[error("Error during shutdown: {}", .0.join("; "))]
    ErrorDuringShutdown(Vec<String>),

    #[error("Sink {0} is not connected")]
    NotConnected(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
