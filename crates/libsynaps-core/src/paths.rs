//! Filesystem locations
//!
//! Configuration lookup follows the XDG base directory conventions, the API
//! endpoint directory is user-scoped unless the daemon runs as root.

use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = "synaps";
pub const SENSORS_CONFIG_FILE: &str = "sensors.toml";
pub const RPIO_CONFIG_FILE: &str = "rpio.toml";
pub const MQTT_CONFIG_FILE: &str = "mqtt.toml";
pub const WS_CONFIG_FILE: &str = "ws.toml";

pub const CONFIG_DIR_ENV: &str = "SYNAPS_CONFIG_DIR";
pub const RUNTIME_DIR_ENV: &str = "SYNAPS_RUNTIME_DIR";

#[cfg(unix)]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> Option<PathBuf> {
    env_path("HOME")
}

/// Directories searched for configuration files, in priority order:
///
/// 1. `$SYNAPS_CONFIG_DIR`
/// 2. current working directory
/// 3. `$XDG_CONFIG_HOME/synaps` (default `~/.config/synaps`)
/// 4. each `$XDG_CONFIG_DIRS` entry + `/synaps` (default `/etc/xdg/synaps`)
/// 5. `/etc/synaps`
pub fn config_search_path() -> Vec<PathBuf> {
    let mut search_path = Vec::new();

    if let Some(dir) = env_path(CONFIG_DIR_ENV) {
        search_path.push(dir);
    }

    if let Ok(cwd) = std::env::current_dir() {
        search_path.push(cwd);
    }

    let config_home = env_path("XDG_CONFIG_HOME").or_else(|| home_dir().map(|h| h.join(".config")));
    if let Some(config_home) = config_home {
        search_path.push(config_home.join(CONFIG_DIR));
    }

    match std::env::var("XDG_CONFIG_DIRS") {
        Ok(dirs) if !dirs.is_empty() => {
            search_path.extend(
                dirs.split(':')
                    .filter(|d| !d.is_empty())
                    .map(|d| Path::new(d).join(CONFIG_DIR)),
            );
        }
        _ => search_path.push(PathBuf::from("/etc/xdg").join(CONFIG_DIR)),
    }

    search_path.push(PathBuf::from("/etc").join(CONFIG_DIR));
    search_path
}

/// First existing `file` along `search_path`
pub fn lookup_file(file: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    search_path
        .iter()
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.is_file())
}

/// Directory holding the API endpoint files
///
/// - `$SYNAPS_RUNTIME_DIR` when set
/// - `/run/synaps` for root
/// - `$XDG_RUNTIME_DIR/synaps` when available
/// - `/tmp/synaps-<uid>` otherwise
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = env_path(RUNTIME_DIR_ENV) {
        return dir;
    }

    if is_root() {
        return PathBuf::from("/run").join(CONFIG_DIR);
    }

    if let Some(dir) = env_path("XDG_RUNTIME_DIR") {
        return dir.join(CONFIG_DIR);
    }

    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", CONFIG_DIR, uid))
    }

    #[cfg(not(unix))]
    {
        std::env::temp_dir().join(CONFIG_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_file_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join(SENSORS_CONFIG_FILE), "").unwrap();

        let search_path = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(
            lookup_file(SENSORS_CONFIG_FILE, &search_path),
            Some(second.path().join(SENSORS_CONFIG_FILE))
        );

        std::fs::write(first.path().join(SENSORS_CONFIG_FILE), "").unwrap();
        assert_eq!(
            lookup_file(SENSORS_CONFIG_FILE, &search_path),
            Some(first.path().join(SENSORS_CONFIG_FILE))
        );
        assert_eq!(lookup_file(MQTT_CONFIG_FILE, &search_path), None);
    }

    #[test]
    fn test_search_path_ends_with_etc() {
        let search_path = config_search_path();
        assert_eq!(search_path.last(), Some(&PathBuf::from("/etc/synaps")));
    }
}
