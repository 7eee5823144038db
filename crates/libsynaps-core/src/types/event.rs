//! State-change events emitted by devices

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    Pressed,
    Released,
}

impl SwitchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::Pressed => "pressed",
            SwitchState::Released => "released",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pressed" => Some(SwitchState::Pressed),
            "released" => Some(SwitchState::Released),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::On => "on",
            RelayState::Off => "off",
        }
    }
}

impl From<bool> for RelayState {
    fn from(on: bool) -> Self {
        if on {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PresenceChange { presence: bool },
    SwitchStateChange { state: SwitchState },
    RelayStateChange { state: RelayState },
}

/// A single state change of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Sensor id (`kind/name`) or relay/switch device id
    pub device_id: String,
    pub kind: EventKind,
}

impl DeviceEvent {
    pub fn new(device_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }

    /// Event type name used in sink payloads
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::PresenceChange { .. } => "presence_change",
            EventKind::SwitchStateChange { .. } => "switch_state_change",
            EventKind::RelayStateChange { .. } => "relay_state_change",
        }
    }

    /// Event-specific payload data
    pub fn data(&self) -> Value {
        match &self.kind {
            EventKind::PresenceChange { presence } => json!({ "presence": presence }),
            EventKind::SwitchStateChange { state } => json!({
                "device_id": self.device_id,
                "switch_state": state.as_str(),
            }),
            EventKind::RelayStateChange { state } => json!({ "state": state.as_str() }),
        }
    }
}
