//! Endpoint naming and discovery
//!
//! Every API server binds a socket named `<unique>.api` in the runtime
//! directory. Clients discover servers by listing that directory; a file
//! being present says nothing about whether its server is alive.

use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::error::IpcError;
use crate::API_FILE_EXTENSION;

/// 4 random bytes in hex followed by the reversed hex of the current
/// UTC timestamp in microseconds
pub fn unique_timestamp_hex() -> String {
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    let micros = chrono::Utc::now().timestamp_micros();
    let reversed: String = format!("{:x}", micros).chars().rev().collect();
    format!("{}{}", hex::encode(random), reversed)
}

/// Fresh endpoint path inside `dir`
pub fn new_endpoint_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.{}", unique_timestamp_hex(), API_FILE_EXTENSION))
}

/// Endpoint id: the socket file name without extension
pub fn endpoint_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// All `*.api` files in `dir`, sorted; a missing directory has none
pub fn list_endpoints(dir: &Path) -> Result<Vec<PathBuf>, IpcError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut endpoints = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(API_FILE_EXTENSION) {
            endpoints.push(path);
        }
    }
    endpoints.sort();
    Ok(endpoints)
}
