//! Device adapter capability trait
//!
//! Every supported device family implements [`DeviceAdapter`]. The registry
//! stores adapters as `Arc<dyn DeviceAdapter>` and the dispatcher drives them
//! concurrently, so implementations must tolerate concurrent calls on
//! distinct instances and serialise access to their own link internally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AdapterError;
use crate::observer::Observers;
use crate::types::command::{CommandOutcome, ConfigChainOutcome};
use crate::types::device::{DeviceId, DeviceKind};

/// Point-in-time status of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device_id: DeviceId,
    /// Whether the continuous reading loop is running
    pub reading: bool,
    /// Kind-specific fields (port, scanning, measurement, relay states...)
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl StatusSnapshot {
    pub fn new(device_id: DeviceId, reading: bool) -> Self {
        Self {
            device_id,
            reading,
            details: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Configuration values read back from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl ConfigSnapshot {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            values: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Unique name within the registry
    fn name(&self) -> &str;

    fn id(&self) -> DeviceId {
        DeviceId::new(self.kind(), self.name())
    }

    /// Observers notified on every state change of this device
    fn observers(&self) -> &Observers;

    async fn send_command(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<CommandOutcome, AdapterError>;

    /// Run a configuration chain for `command`
    async fn configure(
        &self,
        command: &str,
        _args: &[String],
    ) -> Result<ConfigChainOutcome, AdapterError> {
        Err(AdapterError::NotConfigCommand(command.to_string()))
    }

    async fn status(&self) -> Result<StatusSnapshot, AdapterError>;

    async fn config(&self) -> Result<ConfigSnapshot, AdapterError> {
        Ok(ConfigSnapshot::new(self.id()))
    }

    async fn start_reading(&self) -> Result<(), AdapterError>;

    async fn stop_reading(&self) -> Result<(), AdapterError>;

    /// Discard anything buffered on the link before reading is (re)enabled
    async fn clear_buffer(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Whether the device is already doing its job (e.g. radar scanning)
    async fn is_active(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }

    /// Issue the single start command used by autostart
    async fn activate(&self) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::UnknownCommand("activate".to_string()))
    }

    async fn close(&self) -> Result<(), AdapterError>;
}
