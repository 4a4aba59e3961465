use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// No key monitoring session is active.
    Idle,
    /// A `getevent` session is feeding the gesture recognizer.
    Monitoring,
    /// A trigger is in progress or cooling down.
    Triggering,
}

/// Runtime status written by the daemon to `<data dir>/status.toml`.
/// UI clients read this file to display daemon state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Gesture of the active monitoring session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_method: Option<String>,
    /// Whether the privilege broker answered the last liveness check.
    #[serde(default)]
    pub broker_running: bool,
    /// RFC 3339 timestamp of the most recent trigger, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trigger_timestamp: Option<String>,
    /// Strategy that handled the most recent trigger; `none` if all failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trigger_strategy: Option<String>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            trigger_method: None,
            broker_running: false,
            last_trigger_timestamp: None,
            last_trigger_strategy: None,
            error: None,
        }
    }

    /// One `key: value` line per field, for the `status` IPC request.
    pub fn summary(&self) -> String {
        let state = match self.state {
            DaemonState::Idle => "idle",
            DaemonState::Monitoring => "monitoring",
            DaemonState::Triggering => "triggering",
        };
        let mut lines = vec![
            format!("state: {state}"),
            format!("method: {}", self.trigger_method.as_deref().unwrap_or("none")),
            format!("broker: {}", if self.broker_running { "running" } else { "stopped" }),
        ];
        if let Some(at) = &self.last_trigger_timestamp {
            let via = self.last_trigger_strategy.as_deref().unwrap_or("none");
            lines.push(format!("last trigger: {at} via {via}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        lines.join("\n")
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking; a status write failure should
/// never crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::error!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                log::error!("Failed to write status file: {e}");
            }
        }
        Err(e) => log::error!("Failed to serialize status: {e}"),
    }
}
