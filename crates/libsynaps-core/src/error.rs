use thiserror::Error;

/// Configuration and registration errors
///
/// These are raised while a single device, platform or sink is being set up.
/// The caller logs them and skips the offending unit; they never abort a batch.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing configuration field: {field}")]
    MissingField { field: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("device error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl CoreError {
    pub fn missing(field: impl Into<String>) -> Self {
        CoreError::MissingField {
            field: field.into(),
        }
    }

    /// Short machine-readable reason used in log lines
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::MissingField { .. } => "missing_configuration_field",
            CoreError::InvalidConfig(_) => "invalid_configuration",
            CoreError::UnknownDeviceType(_) => "unknown_device_type",
            CoreError::AlreadyRegistered(_) => "duplicated_name",
            CoreError::Adapter(_) => "device_error",
            CoreError::Io(_) => "io_error",
            CoreError::TomlParse(_) => "invalid_toml",
        }
    }
}

/// Errors raised by a device adapter while it is running
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("link error: {0}")]
    Link(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("device {0} is closed")]
    Closed(String),

    #[error("command {0} is not recognized")]
    UnknownCommand(String),

    #[error("command {0} is not a configuration command")]
    NotConfigCommand(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
