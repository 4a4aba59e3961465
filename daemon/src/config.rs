use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;
use crate::keys::TriggerMethod;

pub const DEFAULT_DOUBLE_CLICK_WINDOW_MS: u64 = 400;
pub const MIN_DOUBLE_CLICK_WINDOW_MS: u64 = 100;
pub const MAX_DOUBLE_CLICK_WINDOW_MS: u64 = 1_500;
/// Raw `getevent` stream long-press delay.
pub const DEFAULT_LONG_PRESS_MS: u64 = 600;
/// Forwarded key-callback long-press delay.
pub const DEFAULT_CALLBACK_LONG_PRESS_MS: u64 = 500;
pub const MIN_LONG_PRESS_MS: u64 = 200;
pub const MAX_LONG_PRESS_MS: u64 = 3_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 1_000;
pub const MAX_COOLDOWN_MS: u64 = 10_000;

pub const DEFAULT_OVERLAY_HEIGHT: u32 = 90;
pub const MIN_OVERLAY_OFFSET_Y: i32 = -100;
pub const MAX_OVERLAY_OFFSET_Y: i32 = 100;

pub const DEFAULT_SERVER_PROCESS: &str = "shizuku_server";
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_BROKER_WAIT_SECS: u64 = 60;
pub const DEFAULT_BROKER_POLL_SECS: u64 = 3;

/// Binder transaction code of `IVoiceInteractionManagerService.showSessionFromSession`.
/// Codes follow AIDL declaration order and may shift between releases.
pub const DEFAULT_SHOW_SESSION_CODE: u32 = 3;
/// Binder transaction code of `IContextualSearchManager.startContextualSearch`.
pub const DEFAULT_CONTEXTUAL_SEARCH_CODE: u32 = 1;
/// `SHOW_WITH_ASSIST | SHOW_WITH_SCREENSHOT | SHOW_SOURCE_ASSIST_GESTURE`.
pub const DEFAULT_SESSION_FLAGS: i32 = 7;
pub const DEFAULT_CALLING_PACKAGES: [&str; 4] =
    ["hyperOS_home", "com.oppocts", "com.miui.home", "com.android.systemui"];

/// Root configuration structure. Deserialized from `<data dir>/config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    /// Set by the setup wizard; the daemon only reports it.
    #[serde(default = "default_true")]
    pub first_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger: TriggerConfig::default(),
            overlay: OverlayConfig::default(),
            broker: BrokerConfig::default(),
            service: ServiceConfig::default(),
            first_run: true,
        }
    }
}

/// Gesture selection and recognition timings.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Unknown names fall back to the default method instead of failing the load.
    #[serde(default, deserialize_with = "lenient_method")]
    pub method: TriggerMethod,
    #[serde(default = "default_double_click_window")]
    pub double_click_window_ms: u64,
    #[serde(default = "default_long_press")]
    pub long_press_ms: u64,
    #[serde(default = "default_callback_long_press")]
    pub callback_long_press_ms: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            method: TriggerMethod::default(),
            double_click_window_ms: DEFAULT_DOUBLE_CLICK_WINDOW_MS,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            callback_long_press_ms: DEFAULT_CALLBACK_LONG_PRESS_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

impl TriggerConfig {
    /// Double-click window, clamped to [100, 1500] ms.
    pub fn double_click_window(&self) -> Duration {
        Duration::from_millis(
            self.double_click_window_ms
                .clamp(MIN_DOUBLE_CLICK_WINDOW_MS, MAX_DOUBLE_CLICK_WINDOW_MS),
        )
    }

    /// Long-press delay for the raw event stream, clamped to [200, 3000] ms.
    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms.clamp(MIN_LONG_PRESS_MS, MAX_LONG_PRESS_MS))
    }

    /// Long-press delay for forwarded key callbacks, clamped to [200, 3000] ms.
    pub fn callback_long_press(&self) -> Duration {
        Duration::from_millis(
            self.callback_long_press_ms
                .clamp(MIN_LONG_PRESS_MS, MAX_LONG_PRESS_MS),
        )
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.min(MAX_COOLDOWN_MS))
    }
}

/// Floating overlay button preferences. Owned by the UI layer.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_overlay_height")]
    pub height: u32,
    #[serde(default)]
    pub offset_y: i32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debug_mode: false,
            height: DEFAULT_OVERLAY_HEIGHT,
            offset_y: 0,
        }
    }
}

impl OverlayConfig {
    pub fn effective_offset_y(&self) -> i32 {
        self.offset_y.clamp(MIN_OVERLAY_OFFSET_Y, MAX_OVERLAY_OFFSET_Y)
    }
}

/// Privilege broker (Shizuku) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Explicit `rish` launcher. Looked up on `PATH` when unset.
    #[serde(default)]
    pub rish_path: Option<PathBuf>,
    /// Process name of the broker server, used for liveness checks.
    #[serde(default = "default_server_process")]
    pub server_process: String,
    /// How long a client polls for the remote trigger service socket.
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_ms: u64,
    #[serde(default = "default_broker_wait")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_broker_poll")]
    pub poll_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rish_path: None,
            server_process: DEFAULT_SERVER_PROCESS.to_string(),
            bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
            wait_timeout_secs: DEFAULT_BROKER_WAIT_SECS,
            poll_interval_secs: DEFAULT_BROKER_POLL_SECS,
        }
    }
}

impl BrokerConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Never zero, so the wait loop always sleeps between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Hidden system-service contract and startup behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Spoofed attribution tags tried in order for `showSessionFromSession`.
    #[serde(default = "default_calling_packages")]
    pub calling_packages: Vec<String>,
    #[serde(default = "default_show_session_code")]
    pub show_session_code: u32,
    #[serde(default = "default_contextual_search_code")]
    pub contextual_search_code: u32,
    #[serde(default = "default_session_flags")]
    pub session_flags: i32,
    /// Re-apply flags and resume monitoring when the daemon starts.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
    /// App uids allowed on the trigger socket besides root, shell and the
    /// daemon's own uid. Non-empty opens the socket file to everyone and
    /// leaves gating to the peer credential check.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            calling_packages: default_calling_packages(),
            show_session_code: DEFAULT_SHOW_SESSION_CODE,
            contextual_search_code: DEFAULT_CONTEXTUAL_SEARCH_CODE,
            session_flags: DEFAULT_SESSION_FLAGS,
            restore_on_start: true,
            allowed_uids: Vec::new(),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            log::error!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Watch the directory so write-new + rename saves are seen too.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            log::error!("Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        log::error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn lenient_method<'de, D>(deserializer: D) -> Result<TriggerMethod, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.parse().unwrap_or_else(|e| {
        log::warn!("{e}, using {}", TriggerMethod::default());
        TriggerMethod::default()
    }))
}

fn default_true() -> bool {
    true
}

fn default_double_click_window() -> u64 {
    DEFAULT_DOUBLE_CLICK_WINDOW_MS
}

fn default_long_press() -> u64 {
    DEFAULT_LONG_PRESS_MS
}

fn default_callback_long_press() -> u64 {
    DEFAULT_CALLBACK_LONG_PRESS_MS
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_overlay_height() -> u32 {
    DEFAULT_OVERLAY_HEIGHT
}

fn default_server_process() -> String {
    DEFAULT_SERVER_PROCESS.to_string()
}

fn default_bind_timeout() -> u64 {
    DEFAULT_BIND_TIMEOUT_MS
}

fn default_broker_wait() -> u64 {
    DEFAULT_BROKER_WAIT_SECS
}

fn default_broker_poll() -> u64 {
    DEFAULT_BROKER_POLL_SECS
}

fn default_calling_packages() -> Vec<String> {
    DEFAULT_CALLING_PACKAGES.iter().map(|s| s.to_string()).collect()
}

fn default_show_session_code() -> u32 {
    DEFAULT_SHOW_SESSION_CODE
}

fn default_contextual_search_code() -> u32 {
    DEFAULT_CONTEXTUAL_SEARCH_CODE
}

fn default_session_flags() -> i32 {
    DEFAULT_SESSION_FLAGS
}
