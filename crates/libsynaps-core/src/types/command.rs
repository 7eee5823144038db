//! Device commands and their outcomes

use serde::{Deserialize, Serialize};

/// Properties of a command that the dispatcher checks before any device is touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub value: &'static str,
    pub is_config: bool,
}

/// Commands understood by the SEN0395 radar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sen0395Command {
    SensorStart,
    SensorStop,
    ResetSystem,
    SaveConfig,
    FactoryReset,
    LatencyConfig,
    DetRangeConfig,
    SensitivityConfig,
    InhibitConfig,
    UartOutputConfig,
    LedModeConfig,
    GetRange,
    GetLatency,
    GetSensitivity,
}

impl Sen0395Command {
    pub const ALL: [Sen0395Command; 14] = [
        Sen0395Command::SensorStart,
        Sen0395Command::SensorStop,
        Sen0395Command::ResetSystem,
        Sen0395Command::SaveConfig,
        Sen0395Command::FactoryReset,
        Sen0395Command::LatencyConfig,
        Sen0395Command::DetRangeConfig,
        Sen0395Command::SensitivityConfig,
        Sen0395Command::InhibitConfig,
        Sen0395Command::UartOutputConfig,
        Sen0395Command::LedModeConfig,
        Sen0395Command::GetRange,
        Sen0395Command::GetLatency,
        Sen0395Command::GetSensitivity,
    ];

    /// Arguments the radar expects after `saveCfg`
    pub const SAVE_CONFIG_ARGS: [&'static str; 4] =
        ["0x45670123", "0xCDEF89AB", "0x956128C6", "0xDF54AC89"];

    /// Command name as sent over the wire
    pub fn value(&self) -> &'static str {
        match self {
            Sen0395Command::SensorStart => "sensorStart",
            Sen0395Command::SensorStop => "sensorStop",
            Sen0395Command::ResetSystem => "resetSystem",
            Sen0395Command::SaveConfig => "saveCfg",
            Sen0395Command::FactoryReset => "factoryReset",
            Sen0395Command::LatencyConfig => "outputLatency",
            Sen0395Command::DetRangeConfig => "detRangeCfg",
            Sen0395Command::SensitivityConfig => "setSensitivity",
            Sen0395Command::InhibitConfig => "setInhibit",
            Sen0395Command::UartOutputConfig => "setUartOutput",
            Sen0395Command::LedModeConfig => "setLedMode",
            Sen0395Command::GetRange => "getRange",
            Sen0395Command::GetLatency => "getLatency",
            Sen0395Command::GetSensitivity => "getSensitivity",
        }
    }

    /// Commands that change persisted sensor configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Sen0395Command::LatencyConfig
                | Sen0395Command::DetRangeConfig
                | Sen0395Command::SensitivityConfig
                | Sen0395Command::InhibitConfig
                | Sen0395Command::UartOutputConfig
                | Sen0395Command::LedModeConfig
        )
    }

    pub fn from_value(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.value() == value)
    }

    pub fn spec(&self) -> CommandSpec {
        CommandSpec {
            value: self.value(),
            is_config: self.is_config(),
        }
    }
}

/// Commands understood by a relay platform; the first argument names the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    On,
    Off,
    Toggle,
}

impl RelayCommand {
    pub fn value(&self) -> &'static str {
        match self {
            RelayCommand::On => "on",
            RelayCommand::Off => "off",
            RelayCommand::Toggle => "toggle",
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "on" => Some(RelayCommand::On),
            "off" => Some(RelayCommand::Off),
            "toggle" => Some(RelayCommand::Toggle),
            _ => None,
        }
    }

    pub fn spec(&self) -> CommandSpec {
        CommandSpec {
            value: self.value(),
            is_config: false,
        }
    }
}

/// How a device reacted to a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Done,
    NotApplicable,
    Error,
    Missing,
    Unknown,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Done | CommandResult::NotApplicable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    /// Command line echoed back by the device, if any
    pub command_echo: Option<String>,
    pub result: CommandResult,
    pub message: Option<String>,
}

impl CommandOutcome {
    pub fn new(command: impl Into<String>, result: CommandResult) -> Self {
        Self {
            command: command.into(),
            command_echo: None,
            result,
            message: None,
        }
    }

    pub fn with_echo(mut self, echo: impl Into<String>) -> Self {
        self.command_echo = Some(echo.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Outcome of a pause → configure → save → resume chain
///
/// Steps that were not executed stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChainOutcome {
    pub pause: Option<CommandOutcome>,
    pub configure: Option<CommandOutcome>,
    pub save: Option<CommandOutcome>,
    pub resume: Option<CommandOutcome>,
}

impl ConfigChainOutcome {
    pub fn is_success(&self) -> bool {
        [&self.pause, &self.configure, &self.save, &self.resume]
            .into_iter()
            .flatten()
            .all(CommandOutcome::is_success)
            && self.configure.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_value() {
        assert_eq!(
            Sen0395Command::from_value("detRangeCfg"),
            Some(Sen0395Command::DetRangeConfig)
        );
        assert_eq!(Sen0395Command::from_value("launchRocket"), None);
    }

    #[test]
    fn test_config_flag() {
        assert!(Sen0395Command::LatencyConfig.is_config());
        assert!(!Sen0395Command::SensorStart.is_config());
        assert!(!RelayCommand::Toggle.spec().is_config);
    }

    #[test]
    fn test_chain_success() {
        let mut chain = ConfigChainOutcome::default();
        assert!(!chain.is_success());

        chain.configure = Some(CommandOutcome::new("outputLatency", CommandResult::Done));
        chain.save = Some(CommandOutcome::new("saveCfg", CommandResult::Done));
        assert!(chain.is_success());

        chain.resume = Some(CommandOutcome::new("sensorStart", CommandResult::Missing));
        assert!(!chain.is_success());
    }

    #[test]
    fn test_result_serialization() {
        let json = serde_json::to_string(&CommandResult::NotApplicable).unwrap();
        assert_eq!(json, "\"not_applicable\"");
    }
}
