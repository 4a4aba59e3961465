//! Canonical file paths for the daemon's data files.
//!
//! Everything lives under `$CTS_HOME`, defaulting to `/data/local/tmp/cts`
//! (writable by the shell uid the broker runs us as):
//!   - config.toml  Written by the UI layer, read by the daemon.
//!   - status.toml  Written by the daemon, read by the UI layer.
//!   - cts.sock     Remote trigger service socket.
use std::path::PathBuf;

const HOME_ENV: &str = "CTS_HOME";
const DEFAULT_HOME: &str = "/data/local/tmp/cts";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const SOCKET_FILE_NAME: &str = "cts.sock";

/// Returns the data directory: `$CTS_HOME` or `/data/local/tmp/cts`.
pub fn app_data_dir() -> PathBuf {
    match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_HOME),
    }
}

pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}

pub fn socket_path() -> PathBuf {
    app_data_dir().join(SOCKET_FILE_NAME)
}
