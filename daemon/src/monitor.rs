//! Raw key-event listener: a privileged `getevent -l` child read line by line
//! on a dedicated OS thread.
//!
//! Parsed key transitions are pushed into a [`KeyPipeline`](crate::keys::KeyPipeline)
//! sender. The thread ends when the child's stdout closes, either because
//! [`MonitorHandle::stop`] killed it or because it died on its own; only the
//! latter is reported as [`DaemonEvent::MonitorExited`].
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;

use crate::broker::{CommandRunner, REMOTE_PID_PREFIX};
use crate::error::TriggerError;
use crate::event::DaemonEvent;
use crate::keys::{parse_getevent_line, KeyCommand};

pub const GETEVENT_ARGV: [&str; 2] = ["getevent", "-l"];

/// How long [`MonitorHandle::stop`] waits for the reader thread.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running monitoring session.
pub struct MonitorHandle {
    session: u64,
    child: Child,
    stopping: Arc<AtomicBool>,
    remote: Option<Arc<dyn CommandRunner>>,
    remote_pid: Arc<AtomicU32>,
    reader_done: std_mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Kills the child's whole process group, then the remote reader if the
    /// child was only a relay. Waits at most [`READER_JOIN_TIMEOUT`] for the
    /// reader thread; a reader still blocked after that is left detached.
    pub fn stop(mut self) {
        self.stopping.store(true, Ordering::Release);
        let group = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            log::debug!("getevent group {group} already gone: {e}");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();

        match self.reader_done.recv_timeout(READER_JOIN_TIMEOUT) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = self.thread.join();
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("Reader for session {} still blocked; detaching it", self.session);
            }
        }

        let pid = self.remote_pid.load(Ordering::Acquire);
        if let Some(remote) = self.remote.as_ref().filter(|_| pid != 0) {
            if let Err(e) = remote.run(&format!("kill {pid}")) {
                log::warn!("Failed to kill remote getevent {pid}: {e}");
            }
        }
        log::info!("Key monitoring session {} stopped", self.session);
    }
}

/// Spawns `command` (normally `getevent -l` through the broker) in a new
/// process group and starts the reader thread. `remote` is the runner that
/// can kill the far side when `command` is a relay that reports its remote
/// pid first.
pub fn start(
    mut command: Command,
    remote: Option<Arc<dyn CommandRunner>>,
    session: u64,
    keys_tx: mpsc::Sender<KeyCommand>,
    events_tx: mpsc::Sender<DaemonEvent>,
) -> Result<MonitorHandle, TriggerError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| TriggerError::ProcessFailure(format!("failed to start getevent: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TriggerError::ProcessFailure("getevent stdout not captured".into()))?;

    let stopping = Arc::new(AtomicBool::new(false));
    let remote_pid = Arc::new(AtomicU32::new(0));
    let (done_tx, reader_done) = std_mpsc::channel();
    let thread = {
        let stopping = Arc::clone(&stopping);
        let remote_pid = Arc::clone(&remote_pid);
        std::thread::Builder::new()
            .name(format!("getevent-{session}"))
            .spawn(move || {
                read_events(BufReader::new(stdout), &keys_tx, &remote_pid);
                let _ = done_tx.send(());
                if !stopping.load(Ordering::Acquire) {
                    let err = TriggerError::ProcessFailure("getevent exited".into());
                    log::warn!("Key monitoring session {session} ended: {err}");
                    let _ = events_tx.try_send(DaemonEvent::MonitorExited(session));
                }
            })?
    };

    log::info!("Key monitoring session {session} started");
    Ok(MonitorHandle {
        session,
        child,
        stopping,
        remote,
        remote_pid,
        reader_done,
        thread,
    })
}

fn read_events(reader: impl BufRead, keys_tx: &mpsc::Sender<KeyCommand>, remote_pid: &AtomicU32) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::debug!("getevent read failed: {e}");
                break;
            }
        };
        if let Some(pid) = line.strip_prefix(REMOTE_PID_PREFIX) {
            if let Ok(pid) = pid.trim().parse::<u32>() {
                log::debug!("Remote getevent pid {pid}");
                remote_pid.store(pid, Ordering::Release);
            }
            continue;
        }
        let Some(raw) = parse_getevent_line(&line) else {
            continue;
        };
        log::trace!("{} {} {}", raw.device, raw.key, raw.action.as_str());
        let command = KeyCommand::Input {
            input: raw.to_input(),
            reply: None,
        };
        if keys_tx.blocking_send(command).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{stdout, RecordingRunner};
    use crate::keys::event::{Key, KeyAction};
    use std::time::Duration;

    fn script(lines: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("printf '{lines}'"));
        cmd
    }

    #[test]
    fn reads_key_lines_and_skips_noise() {
        let text = "add device 1: /dev/input/event3\n\
                    /dev/input/event3: EV_KEY KEY_VOLUMEDOWN DOWN\n\
                    /dev/input/event3: EV_SYN SYN_REPORT 00000000\n\
                    /dev/input/event3: EV_KEY KEY_VOLUMEDOWN REPEAT\n\
                    /dev/input/event3: EV_KEY KEY_VOLUMEDOWN UP\n";
        let (tx, mut rx) = mpsc::channel(8);
        let remote_pid = AtomicU32::new(0);
        read_events(text.as_bytes(), &tx, &remote_pid);
        drop(tx);

        let mut inputs = Vec::new();
        while let Ok(KeyCommand::Input { input, .. }) = rx.try_recv() {
            inputs.push(input);
        }
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].key, Key::VolumeDown);
        assert!(inputs[0].is_down_edge());
        assert_eq!((inputs[1].action, inputs[1].repeat), (KeyAction::Down, 1));
        assert_eq!(inputs[2].action, KeyAction::Up);
    }

    #[test]
    fn stops_reading_when_pipeline_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let text = "/dev/input/event0: EV_KEY KEY_CAMERA DOWN\n/dev/input/event0: EV_KEY KEY_CAMERA UP\n";
        read_events(text.as_bytes(), &tx, &AtomicU32::new(0));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn child_exit_is_reported_with_session_id() {
        let (keys_tx, mut keys_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = start(
            script("/dev/input/event1: EV_KEY KEY_VOLUMEUP DOWN\\n"),
            None,
            7,
            keys_tx,
            events_tx,
        )
        .unwrap();
        assert_eq!(handle.session(), 7);

        let first = tokio::time::timeout(Duration::from_secs(5), keys_rx.recv()).await.unwrap();
        assert!(matches!(first, Some(KeyCommand::Input { ref input, .. }) if input.key == Key::VolumeUp));

        let exited = tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap();
        assert!(matches!(exited, Some(DaemonEvent::MonitorExited(7))));
        tokio::task::spawn_blocking(move || handle.stop()).await.unwrap();
    }

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_child_without_reporting_exit() {
        let (keys_tx, _keys_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = start(shell("exec sleep 30"), None, 1, keys_tx, events_tx).unwrap();

        tokio::task::spawn_blocking(move || handle.stop()).await.unwrap();
        assert!(events_rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_grandchildren_holding_the_pipe() {
        // The shell forks `sleep`, which inherits stdout; killing only the
        // shell would leave the reader waiting for EOF.
        let (keys_tx, _keys_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = start(shell("sleep 30; true"), None, 2, keys_tx, events_tx).unwrap();

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(10), tokio::task::spawn_blocking(move || handle.stop()))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(events_rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_remote_reader_by_reported_pid() {
        let (keys_tx, mut keys_rx) = mpsc::channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let remote = Arc::new(RecordingRunner::new(|_| stdout("")));
        let handle = start(
            shell("echo pid 4242; echo '/dev/input/event2: EV_KEY KEY_CAMERA DOWN'; sleep 30; true"),
            Some(remote.clone()),
            3,
            keys_tx,
            events_tx,
        )
        .unwrap();

        // The pid line is consumed, not parsed as a key.
        let first = tokio::time::timeout(Duration::from_secs(5), keys_rx.recv()).await.unwrap();
        assert!(matches!(first, Some(KeyCommand::Input { ref input, .. }) if input.key == Key::Camera));

        tokio::task::spawn_blocking(move || handle.stop()).await.unwrap();
        assert_eq!(remote.ran(), vec!["kill 4242"]);
    }

    #[test]
    fn read_events_records_remote_pid() {
        let (tx, _rx) = mpsc::channel(8);
        let remote_pid = AtomicU32::new(0);
        read_events("pid 31337\n".as_bytes(), &tx, &remote_pid);
        assert_eq!(remote_pid.load(Ordering::Acquire), 31337);
    }

    #[test]
    fn missing_binary_is_process_failure() {
        let (keys_tx, _keys_rx) = mpsc::channel(1);
        let (events_tx, _events_rx) = mpsc::channel(1);
        let result = start(Command::new("/nonexistent/getevent"), None, 1, keys_tx, events_tx);
        assert!(matches!(result, Err(TriggerError::ProcessFailure(_))));
    }
}
