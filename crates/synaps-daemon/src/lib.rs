//! synaps daemon
//!
//! The daemon provides:
//! - A JSON-RPC API on a local datagram socket
//! - The device registry and the factories building adapters from TOML
//! - Event delivery to MQTT brokers and WebSocket endpoints
//! - Startup and shutdown orchestration

pub mod api;
pub mod devices;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod settings;
pub mod sinks;

pub use api::{ApiError, Dispatcher};
pub use error::DaemonError;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use registry::Registry;
pub use settings::Settings;
