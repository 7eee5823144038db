use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::command::{CommandSpec, RelayCommand, Sen0395Command};

/// Family of device adapters handled by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// DFRobot SEN0395 mmWave presence radar
    Sen0395,
    /// DFRobot SEN0311 ultrasonic distance sensor
    Sen0311,
    /// GPIO relay/switch platform
    Rpio,
}

#[derive(Debug, Error)]
#[error("unknown device kind: {0}")]
pub struct UnknownKind(pub String);

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Sen0395, DeviceKind::Sen0311, DeviceKind::Rpio];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Sen0395 => "sen0395",
            DeviceKind::Sen0311 => "sen0311",
            DeviceKind::Rpio => "rpio",
        }
    }

    /// Look up a command accepted by devices of this kind
    pub fn command_spec(&self, name: &str) -> Option<CommandSpec> {
        match self {
            DeviceKind::Sen0395 => Sen0395Command::from_value(name).map(|c| c.spec()),
            DeviceKind::Rpio => RelayCommand::from_value(name).map(|c| c.spec()),
            DeviceKind::Sen0311 => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Identity of a registered device: kind plus unique name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub name: String,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("SEN0395".parse::<DeviceKind>().unwrap(), DeviceKind::Sen0395);
        assert_eq!("rpio".parse::<DeviceKind>().unwrap(), DeviceKind::Rpio);
        assert!("sen9999".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new(DeviceKind::Sen0311, "door");
        assert_eq!(id.to_string(), "sen0311/door");
    }

    #[test]
    fn test_command_spec_per_kind() {
        assert!(DeviceKind::Sen0395.command_spec("sensorStart").is_some());
        assert!(DeviceKind::Rpio.command_spec("toggle").is_some());
        assert!(DeviceKind::Sen0311.command_spec("sensorStart").is_none());
    }
}
