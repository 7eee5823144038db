//! IPC error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// Endpoint socket could not be bound
    #[error("Cannot bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Server was already stopped and cannot be restarted
    #[error("Server has been stopped already")]
    StoppedAlready,

    /// Server shape needs a running tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Request rejected by the kernel as oversized
    #[error("Payload of {0} bytes is too large for a datagram")]
    PayloadTooLarge(usize),

    /// No endpoint answered
    #[error("No service is running")]
    NoService,

    /// More than one endpoint answered where exactly one was expected
    #[error("Expected one response, got {0}")]
    MultipleResponses(usize),

    /// Transport fault while waiting for the service (e.g. timeout)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Error reported by the service itself
    #[error("Service failure [{code}]: {message}")]
    ServiceFailure { code: i64, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-RPC error codes
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const DEVICE_NOT_FOUND: i64 = -32001;
    pub const NO_DEVICES: i64 = -32002;
    pub const UNKNOWN_COMMAND: i64 = -32003;
    pub const NOT_CONFIG_COMMAND: i64 = -32004;
}
