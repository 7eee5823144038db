//! Core library for synaps
//!
//! This crate provides:
//! - Device kinds, identities, commands and state-change events
//! - The `DeviceAdapter` capability trait and ordered observer lists
//! - TOML configuration nodes and path resolution
//! - Built-in adapters: SEN0395 presence radar, SEN0311 ultrasonic distance
//!   sensor and the Kincony Server-Mini relay platform

pub mod adapter;
pub mod config;
pub mod devices;
pub mod error;
pub mod link;
pub mod observer;
pub mod paths;
pub mod types;

pub use adapter::{ConfigSnapshot, DeviceAdapter, StatusSnapshot};
pub use config::ConfigNode;
pub use error::{AdapterError, CoreError};
pub use link::{SensorLink, SerialLink};
pub use observer::{Observer, Observers};
pub use types::command::{
    CommandOutcome, CommandResult, CommandSpec, ConfigChainOutcome, RelayCommand, Sen0395Command,
};
pub use types::device::{DeviceId, DeviceKind};
pub use types::event::{DeviceEvent, EventKind, RelayState, SwitchState};
