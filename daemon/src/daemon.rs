use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::broker::{Broker, CommandRunner, LocalShell, ShizukuChannel};
use crate::config::{self, Config, ServiceConfig, TriggerConfig};
use crate::error::TriggerError;
use crate::event::{DaemonEvent, TriggerSource};
use crate::flags::FlagMutator;
use crate::invoker::Invoker;
use crate::ipc::{self, PeerAccess, Request};
use crate::keys::{
    KeyCommand, KeyInput, KeyPipeline, Recognizer, RecentKeys, SharedRecentKeys, Timing, TriggerGate,
    TriggerMethod, RECENT_KEYS_REPORTED,
};
use crate::monitor::{self, MonitorHandle, GETEVENT_ARGV};
use crate::status::{self, DaemonState, DaemonStatus};
use crate::{paths, process_monitor, restore, sysprop};

fn stream_timing(trigger: &TriggerConfig) -> Timing {
    Timing {
        double_click_window: trigger.double_click_window(),
        long_press: trigger.long_press(),
    }
}

fn callback_timing(trigger: &TriggerConfig) -> Timing {
    Timing {
        double_click_window: trigger.double_click_window(),
        long_press: trigger.callback_long_press(),
    }
}

/// Builds the invoker chains the daemon runs.
pub trait Chains: Send + Sync + 'static {
    /// Chain for gestures recognized inside the daemon.
    fn gesture(&self, service: &ServiceConfig) -> Invoker;
    /// Chain for the remote `trigger` request.
    fn remote(&self, service: &ServiceConfig) -> Invoker;
}

struct SystemChains {
    local: Arc<dyn CommandRunner>,
    broker: Arc<Broker>,
    sdk: Option<u32>,
}

impl Chains for SystemChains {
    fn gesture(&self, service: &ServiceConfig) -> Invoker {
        Invoker::for_daemon(Arc::clone(&self.local), self.broker.clone(), service, self.sdk)
    }

    fn remote(&self, service: &ServiceConfig) -> Invoker {
        Invoker::session_only(Arc::clone(&self.local), service)
    }
}

/// Produces the `getevent` child for a monitoring session, plus the runner
/// that can kill its remote side when the child is only a relay.
pub trait EventSource: Send + Sync + 'static {
    fn spawn(&self) -> Result<(Command, Option<Arc<dyn CommandRunner>>), TriggerError>;
}

/// `getevent` through the broker's channel.
struct BrokerSource(Arc<Broker>);

impl EventSource for BrokerSource {
    fn spawn(&self) -> Result<(Command, Option<Arc<dyn CommandRunner>>), TriggerError> {
        let channel = self.0.channel();
        let command = channel.spawn_command(&GETEVENT_ARGV)?;
        let remote = channel
            .spawns_remotely()
            .then(|| Arc::clone(&self.0) as Arc<dyn CommandRunner>);
        Ok((command, remote))
    }
}

struct Monitoring {
    handle: MonitorHandle,
    pipeline: KeyPipeline,
    method: TriggerMethod,
}

/// Owns the raw-stream monitoring session: at most one `getevent` child
/// and its recognizer at a time.
struct KeyMonitor {
    source: Arc<dyn EventSource>,
    recent: SharedRecentKeys,
    event_tx: mpsc::Sender<DaemonEvent>,
    next_session: u64,
    active: Option<Monitoring>,
}

impl KeyMonitor {
    fn method(&self) -> Option<TriggerMethod> {
        self.active.as_ref().map(|m| m.method)
    }

    /// Replaces any running session. `TriggerMethod::None` just stops.
    async fn start(&mut self, method: TriggerMethod, timing: Timing) -> Result<(), TriggerError> {
        self.stop().await;
        if method == TriggerMethod::None {
            return Ok(());
        }

        let (command, remote) = self.source.spawn()?;
        let session = self.next_session;
        self.next_session += 1;

        let pipeline = KeyPipeline::spawn(
            Recognizer::new(method, timing),
            Arc::clone(&self.recent),
            self.event_tx.clone(),
            TriggerSource::KeyStream,
        );
        match monitor::start(command, remote, session, pipeline.sender(), self.event_tx.clone()) {
            Ok(handle) => {
                log::info!("Monitoring {method} (session {session})");
                self.active = Some(Monitoring { handle, pipeline, method });
                Ok(())
            }
            Err(e) => {
                pipeline.stop().await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        let Some(Monitoring { handle, pipeline, .. }) = self.active.take() else {
            return;
        };
        // Killing the child and joining the reader both block.
        if let Err(e) = tokio::task::spawn_blocking(move || handle.stop()).await {
            log::error!("Monitor shutdown failed: {e}");
        }
        pipeline.stop().await;
    }

    /// Drops the session if `session` is the active one. Returns whether it was.
    async fn on_exited(&mut self, session: u64) -> bool {
        if self.active.as_ref().map(|m| m.handle.session()) != Some(session) {
            return false;
        }
        self.stop().await;
        true
    }

    async fn set_timing(&self, timing: Timing) {
        if let Some(m) = &self.active {
            let _ = m.pipeline.sender().send(KeyCommand::SetTiming(timing)).await;
        }
    }
}

/// Daemon state driven by [`DaemonEvent`]s.
struct Daemon {
    config: Config,
    status: DaemonStatus,
    status_path: PathBuf,
    gate: TriggerGate,
    recent: SharedRecentKeys,
    chains: Arc<dyn Chains>,
    monitor: KeyMonitor,
    callback: KeyPipeline,
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl Daemon {
    fn new(
        config: Config,
        status_path: PathBuf,
        chains: Arc<dyn Chains>,
        source: Arc<dyn EventSource>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let recent = RecentKeys::shared();
        let callback = KeyPipeline::spawn(
            Recognizer::new(config.trigger.method, callback_timing(&config.trigger)),
            Arc::clone(&recent),
            event_tx.clone(),
            TriggerSource::KeyCallback,
        );
        let monitor = KeyMonitor {
            source,
            recent: Arc::clone(&recent),
            event_tx: event_tx.clone(),
            next_session: 1,
            active: None,
        };
        let daemon = Self {
            gate: TriggerGate::new(config.trigger.cooldown()),
            config,
            status: DaemonStatus::new(),
            status_path,
            recent,
            chains,
            monitor,
            callback,
            event_tx,
        };
        daemon.write_status();
        daemon
    }

    fn write_status(&self) {
        status::write_status(&self.status_path, &self.status);
    }

    /// Re-derives state and gesture from the monitor and gate, then persists.
    fn refresh_status(&mut self) {
        self.status.trigger_method = self.monitor.method().map(|m| m.to_string());
        self.status.state = if self.gate.is_triggering() {
            DaemonState::Triggering
        } else if self.monitor.method().is_some() {
            DaemonState::Monitoring
        } else {
            DaemonState::Idle
        };
        self.write_status();
    }

    async fn start_monitoring(&mut self, method: TriggerMethod) -> bool {
        let started = match self.monitor.start(method, stream_timing(&self.config.trigger)).await {
            Ok(()) => {
                self.status.error = None;
                true
            }
            Err(e) => {
                log::error!("Cannot start monitoring {method}: {e}");
                self.status.error = Some(format!("Monitoring failed: {e}"));
                false
            }
        };
        self.refresh_status();
        started
    }

    /// Handles one event. Returns false once the daemon should exit.
    async fn handle(&mut self, evt: DaemonEvent) -> bool {
        match evt {
            DaemonEvent::TriggerRequested(source) => {
                let Some(session) = self.gate.try_begin() else {
                    log::debug!("Trigger from {source:?} ignored: already triggering");
                    return true;
                };
                self.status.state = DaemonState::Triggering;
                self.write_status();

                let invoker = self.chains.gesture(&self.config.service);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let strategy = tokio::task::spawn_blocking(move || invoker.invoke_with_log().succeeded)
                        .await
                        .unwrap_or_else(|e| {
                            log::error!("Trigger task failed: {e}");
                            None
                        });
                    session.finish().await;
                    let _ = tx.send(DaemonEvent::TriggerFinished { source, strategy }).await;
                });
            }

            DaemonEvent::TriggerFinished { source, strategy } => {
                log::info!("Trigger from {source:?} finished via {}", strategy.unwrap_or("none"));
                self.status.last_trigger_timestamp = Some(chrono::Local::now().to_rfc3339());
                self.status.last_trigger_strategy = Some(strategy.unwrap_or("none").to_string());
                self.status.error = match strategy {
                    Some(_) => None,
                    None => Some("All trigger strategies failed".to_string()),
                };
                self.refresh_status();
            }

            DaemonEvent::Remote(request, reply) => self.on_request(request, reply).await,

            DaemonEvent::MonitorExited(session) => {
                if self.monitor.on_exited(session).await {
                    self.status.error = Some("Key monitor exited unexpectedly".to_string());
                    self.refresh_status();
                }
            }

            DaemonEvent::Restored(outcome) => match outcome {
                Ok(Some(method)) if self.monitor.method().is_none() => {
                    self.start_monitoring(method).await;
                }
                Ok(_) => log::info!("Restore finished"),
                Err(e) => {
                    log::warn!("Restore failed: {e}");
                    self.status.error = Some(format!("Restore failed: {e}"));
                    self.write_status();
                }
            },

            DaemonEvent::BrokerStarted => {
                self.status.broker_running = true;
                self.write_status();
            }

            DaemonEvent::BrokerStopped => {
                self.status.broker_running = false;
                self.write_status();
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                log::info!("Config reloaded");
                let sender = self.callback.sender();
                if new_config.trigger.method != self.config.trigger.method {
                    let _ = sender.send(KeyCommand::SetMethod(new_config.trigger.method)).await;
                }
                let _ = sender
                    .send(KeyCommand::SetTiming(callback_timing(&new_config.trigger)))
                    .await;
                self.monitor.set_timing(stream_timing(&new_config.trigger)).await;
                self.gate.set_cooldown(new_config.trigger.cooldown());
                self.config = new_config;
            }

            DaemonEvent::Shutdown => {
                log::info!("Shutting down");
                self.monitor.stop().await;
                self.status.state = DaemonState::Idle;
                self.status.trigger_method = None;
                self.status.error = None;
                self.write_status();
                return false;
            }
        }
        true
    }

    async fn on_request(&mut self, request: Request, reply: oneshot::Sender<String>) {
        match request {
            Request::Trigger => {
                // The privileged service path: the session call only, outside the gate.
                let invoker = self.chains.remote(&self.config.service);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let strategy = tokio::task::spawn_blocking(move || invoker.invoke_with_log().succeeded)
                        .await
                        .ok()
                        .flatten();
                    let _ = reply.send(strategy.is_some().to_string());
                    let _ = tx
                        .send(DaemonEvent::TriggerFinished { source: TriggerSource::Remote, strategy })
                        .await;
                });
            }

            Request::Start(method) => {
                let started = self.start_monitoring(method).await;
                let _ = reply.send(started.to_string());
            }

            Request::Stop => {
                self.monitor.stop().await;
                self.refresh_status();
                let _ = reply.send("ok".to_string());
            }

            Request::Keys => {
                let keys = self
                    .recent
                    .lock()
                    .map(|k| k.render_tail(RECENT_KEYS_REPORTED))
                    .unwrap_or_default();
                let _ = reply.send(keys);
            }

            Request::Key { code, action, repeat } => {
                let sender = self.callback.sender();
                tokio::spawn(async move {
                    let (consumed_tx, consumed_rx) = oneshot::channel();
                    let command = KeyCommand::Input {
                        input: KeyInput::from_keycode(code, action, repeat),
                        reply: Some(consumed_tx),
                    };
                    let consumed = sender.send(command).await.is_ok() && consumed_rx.await.unwrap_or(false);
                    let _ = reply.send(consumed.to_string());
                });
            }

            Request::Status => {
                let _ = reply.send(self.status.summary());
            }
        }
    }

    async fn close(self) {
        self.callback.stop().await;
    }
}

pub async fn run() -> Result<()> {
    // ── Data directory ────────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        log::error!("Config error (using defaults): {e:#}");
        Config::default()
    });

    // ── Shared handles ────────────────────────────────────────────────────────
    let channel = ShizukuChannel::from_config(&config.broker);
    if !channel.is_privileged() {
        log::warn!("Not running as shell or root; privileged calls go through rish");
    }
    let broker = Arc::new(Broker::new(channel));
    let local: Arc<dyn CommandRunner> = Arc::new(LocalShell);
    let chains = Arc::new(SystemChains {
        local,
        broker: Arc::clone(&broker),
        sdk: sysprop::sdk_int(),
    });

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    let socket_path = paths::socket_path();
    let access = PeerAccess::for_daemon(&config.service.allowed_uids);
    let listener = ipc::bind_listener(&socket_path, access.socket_mode())?;
    tokio::spawn(ipc::serve(listener, access, event_tx.clone()));
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    tokio::spawn(process_monitor::run(
        config.broker.server_process.clone(),
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    if config.service.restore_on_start {
        let broker = Arc::clone(&broker);
        let tx = event_tx.clone();
        let method = config.trigger.method;
        let (timeout, poll) = (config.broker.wait_timeout(), config.broker.poll_interval());
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let flags = FlagMutator::new(broker.clone());
                restore::restore(|| broker.has_permission(), &flags, method, timeout, poll)
            })
            .await;
            match result {
                Ok(outcome) => {
                    let _ = tx.send(DaemonEvent::Restored(outcome)).await;
                }
                Err(e) => log::error!("Restore task failed: {e}"),
            }
        });
    }

    let mut daemon = Daemon::new(
        config,
        paths::status_file_path(),
        chains,
        Arc::new(BrokerSource(broker)),
        event_tx.clone(),
    );
    log::info!("cts daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        if !daemon.handle(evt).await {
            break;
        }
    }

    daemon.close().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        log::debug!("Socket cleanup: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::Strategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Strategy that counts attempts and succeeds after a short delay.
    struct Slow {
        attempts: Arc<AtomicUsize>,
    }

    impl Strategy for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn attempt(&self) -> Result<(), TriggerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }
    }

    struct CountingChains {
        attempts: Arc<AtomicUsize>,
    }

    impl Chains for CountingChains {
        fn gesture(&self, _: &ServiceConfig) -> Invoker {
            Invoker::new(vec![Box::new(Slow { attempts: Arc::clone(&self.attempts) })])
        }

        fn remote(&self, service: &ServiceConfig) -> Invoker {
            self.gesture(service)
        }
    }

    /// `getevent` stand-in that idles until killed.
    struct IdleSource;

    impl EventSource for IdleSource {
        fn spawn(&self) -> Result<(Command, Option<Arc<dyn CommandRunner>>), TriggerError> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exec sleep 30");
            Ok((cmd, None))
        }
    }

    struct Harness {
        daemon: Daemon,
        events: mpsc::Receiver<DaemonEvent>,
        attempts: Arc<AtomicUsize>,
        status_path: PathBuf,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let status_path = dir.path().join("status.toml");
        let mut config = Config::default();
        config.trigger.cooldown_ms = 0;
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, events) = mpsc::channel(32);
        let daemon = Daemon::new(
            config,
            status_path.clone(),
            Arc::new(CountingChains { attempts: Arc::clone(&attempts) }),
            Arc::new(IdleSource),
            tx,
        );
        Harness { daemon, events, attempts, status_path, _dir: dir }
    }

    fn written(h: &Harness) -> DaemonStatus {
        toml::from_str(&std::fs::read_to_string(&h.status_path).unwrap()).unwrap()
    }

    async fn next_finished(events: &mut mpsc::Receiver<DaemonEvent>) -> DaemonEvent {
        loop {
            let evt = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(evt, DaemonEvent::TriggerFinished { .. }) {
                return evt;
            }
        }
    }

    async fn request(daemon: &mut Daemon, request: Request) -> String {
        let (tx, rx) = oneshot::channel();
        assert!(daemon.handle(DaemonEvent::Remote(request, tx)).await);
        rx.await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gate_refuses_second_trigger_while_one_runs() {
        let mut h = harness();
        assert!(h.daemon.handle(DaemonEvent::TriggerRequested(TriggerSource::KeyStream)).await);
        assert_eq!(written(&h).state, DaemonState::Triggering);
        assert!(h.daemon.handle(DaemonEvent::TriggerRequested(TriggerSource::KeyCallback)).await);

        let finished = next_finished(&mut h.events).await;
        assert!(matches!(
            finished,
            DaemonEvent::TriggerFinished { source: TriggerSource::KeyStream, strategy: Some("slow") }
        ));
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);

        h.daemon.handle(finished).await;
        let status = written(&h);
        assert_eq!(status.state, DaemonState::Idle);
        assert_eq!(status.last_trigger_strategy.as_deref(), Some("slow"));
        assert!(status.error.is_none());

        // Gate reopened after the (zero) cooldown.
        h.daemon.handle(DaemonEvent::TriggerRequested(TriggerSource::KeyStream)).await;
        next_finished(&mut h.events).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
        h.daemon.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_exit_clears_monitoring_state() {
        let mut h = harness();
        assert_eq!(request(&mut h.daemon, Request::Start(TriggerMethod::VolBoth)).await, "true");
        let status = written(&h);
        assert_eq!(status.state, DaemonState::Monitoring);
        assert_eq!(status.trigger_method.as_deref(), Some("vol_both"));

        // A stale session id is ignored.
        h.daemon.handle(DaemonEvent::MonitorExited(99)).await;
        assert_eq!(written(&h).state, DaemonState::Monitoring);

        h.daemon.handle(DaemonEvent::MonitorExited(1)).await;
        let status = written(&h);
        assert_eq!(status.state, DaemonState::Idle);
        assert!(status.trigger_method.is_none());
        assert_eq!(status.error.as_deref(), Some("Key monitor exited unexpectedly"));
        assert!(request(&mut h.daemon, Request::Status).await.starts_with("state: idle\nmethod: none"));
        h.daemon.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restore_outcome_reaches_status_file() {
        let mut h = harness();
        h.daemon.handle(DaemonEvent::Restored(Err(TriggerError::PermissionDenied))).await;
        let status = written(&h);
        assert_eq!(status.error.as_deref(), Some("Restore failed: privileged channel not authorized"));
        assert_eq!(status.state, DaemonState::Idle);

        h.daemon
            .handle(DaemonEvent::Restored(Ok(Some(TriggerMethod::VolDownLong))))
            .await;
        let status = written(&h);
        assert_eq!(status.state, DaemonState::Monitoring);
        assert_eq!(status.trigger_method.as_deref(), Some("vol_down_long"));
        assert!(status.error.is_none());

        assert!(!h.daemon.handle(DaemonEvent::Shutdown).await);
        assert_eq!(written(&h).state, DaemonState::Idle);
        h.daemon.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broker_liveness_is_tracked() {
        let mut h = harness();
        h.daemon.handle(DaemonEvent::BrokerStarted).await;
        assert!(written(&h).broker_running);
        h.daemon.handle(DaemonEvent::BrokerStopped).await;
        assert!(!written(&h).broker_running);
        h.daemon.close().await;
    }
}
