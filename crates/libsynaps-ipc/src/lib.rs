//! Local transport and RPC plumbing for the synaps daemon
//!
//! This crate provides:
//! - Datagram socket servers in two shapes (async task, blocking thread)
//! - Endpoint naming and directory discovery
//! - `SocketClient` for multi-endpoint exchanges and liveness pings
//! - JSON-RPC 2.0 envelopes and the `ApiClient` built on them

pub mod client;
pub mod discovery;
pub mod error;
pub mod messages;
pub mod socket;

pub use client::{ApiClient, PingResult, ServerResponse, SocketClient, TransportFault};
pub use discovery::{endpoint_id, list_endpoints, new_endpoint_path, unique_timestamp_hex};
pub use error::IpcError;
pub use messages::{ErrorObject, RequestEnvelope, ResponseEnvelope};
pub use socket::{BlockingSocketServer, EndpointServer, Handler, ServerShape, SocketServer};

/// JSON-RPC protocol version carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// File extension of API endpoint sockets
pub const API_FILE_EXTENSION: &str = "api";

/// Default request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Receive buffer size; larger datagrams are truncated by the kernel
pub const RECV_BUFFER_LENGTH: usize = 65536;

/// Liveness probe answered by the transport without reaching the handler
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
