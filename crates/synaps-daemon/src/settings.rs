//! Process settings and configuration file loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use libsynaps_core::paths;
use libsynaps_core::ConfigNode;
use libsynaps_ipc::ServerShape;
use tracing::info;

use crate::error::DaemonError;

/// Default bound on a single device close or sink disconnect
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the startup probe waits for a running instance to answer
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for a WebSocket endpoint during registration
pub const WS_CONNECT_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directories searched for configuration files, in priority order
    pub search_path: Vec<PathBuf>,
    /// Directory holding the API endpoint files
    pub runtime_dir: PathBuf,
    pub server_shape: ServerShape,
    pub unit_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Settings {
    /// Settings resolved from the environment
    pub fn from_env() -> Self {
        Self {
            search_path: paths::config_search_path(),
            runtime_dir: paths::runtime_dir(),
            server_shape: ServerShape::default(),
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Settings reading configuration only from `config_dir`
    pub fn isolated(config_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            search_path: vec![config_dir.into()],
            runtime_dir: runtime_dir.into(),
            server_shape: ServerShape::default(),
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Search `dir` before everything else
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_path.insert(0, dir.into());
        self
    }
}

/// Load `file` from the first directory of `search_path` that has it
///
/// A missing file is not an error; that part of the daemon stays empty.
pub async fn read_config_file(
    file: &str,
    search_path: &[PathBuf],
) -> Result<Option<ConfigNode>, DaemonError> {
    let Some(path) = paths::lookup_file(file, search_path) else {
        info!(file, "No config file found");
        return Ok(None);
    };
    read_config_path(&path).await.map(Some)
}

pub async fn read_config_path(path: &Path) -> Result<ConfigNode, DaemonError> {
    info!(file = %path.display(), "Loading config file");
    let content = tokio::fs::read_to_string(path).await?;
    Ok(ConfigNode::parse("", &content)?)
}
