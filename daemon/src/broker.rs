//! Privilege broker client.
//!
//! Shell-level commands are either run directly (when this process already
//! holds the shell or root uid, e.g. started by Shizuku or `adb shell`) or
//! through the broker's `rish` launcher. Liveness of the broker is judged by
//! its server process when that is visible, otherwise by asking `rish`.
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use sysinfo::System;

use crate::config::BrokerConfig;
use crate::error::TriggerError;
use crate::process_monitor;

pub const SHIZUKU_PACKAGE: &str = "moe.shizuku.privileged.api";
/// First stdout line of a remote [`ShizukuChannel::spawn_command`] child.
pub const REMOTE_PID_PREFIX: &str = "pid ";
const ROOT_UID: u32 = 0;
const SHELL_UID: u32 = 2000;

/// Captured output of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// stdout alone, or `OUT: …\nERR: …` when stderr has content; trimmed.
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            format!("OUT: {}\nERR: {}", self.stdout, self.stderr)
                .trim()
                .to_string()
        }
    }
}

impl From<Output> for ProcessOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs one shell command line to completion.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<ProcessOutput, TriggerError>;

    /// Like [`run`](Self::run), but logs failures and returns the combined
    /// output, or `None` if the command could not be run at all.
    fn execute(&self, command: &str) -> Option<String> {
        match self.run(command) {
            Ok(output) => {
                let combined = output.combined();
                log::debug!("Command executed: {command} -> {combined}");
                Some(combined)
            }
            Err(e) => {
                log::warn!("Command failed: {command}: {e}");
                None
            }
        }
    }
}

/// `sh -c` as the current (possibly unprivileged) uid.
pub struct LocalShell;

impl CommandRunner for LocalShell {
    fn run(&self, command: &str) -> Result<ProcessOutput, TriggerError> {
        let output = Command::new("sh").arg("-c").arg(command).output()?;
        Ok(output.into())
    }
}

/// A privileged command channel.
pub trait PrivilegeChannel: Send + Sync {
    /// Whether the broker is reachable at all.
    fn ping(&self) -> bool;
    /// Whether this caller may use the broker. Errors on a dead channel.
    fn check_permission(&self) -> Result<bool, TriggerError>;
    /// Runs `command` with broker privileges and waits for it.
    fn new_process(&self, command: &str) -> Result<ProcessOutput, TriggerError>;
    /// Whether the broker looks installed on this device.
    fn is_installed(&self) -> bool;
}

/// Shizuku as seen from a native process.
pub struct ShizukuChannel {
    server_process: String,
    rish: Option<PathBuf>,
    uid: u32,
}

impl ShizukuChannel {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let rish = config
            .rish_path
            .clone()
            .filter(|p| p.exists())
            .or_else(|| which::which("rish").ok());
        Self {
            server_process: config.server_process.clone(),
            rish,
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    /// True when this process already runs with shell or root privileges.
    pub fn is_privileged(&self) -> bool {
        self.uid == ROOT_UID || self.uid == SHELL_UID
    }

    /// `sh -c command` (or `rish -c command`) with broker privileges.
    pub fn command(&self, command: &str) -> Result<Command, TriggerError> {
        let mut cmd = if self.is_privileged() {
            Command::new("sh")
        } else {
            match &self.rish {
                Some(rish) => Command::new(rish),
                None => return Err(TriggerError::PermissionDenied),
            }
        };
        cmd.arg("-c").arg(command);
        Ok(cmd)
    }

    /// A long-lived child running `argv` with broker privileges.
    ///
    /// Privileged callers exec the program directly, so the child is the
    /// program. Through `rish` the program runs remotely and the child is
    /// only its local relay; the first stdout line is then `pid <remote pid>`
    /// so the caller can kill the remote side too.
    pub fn spawn_command(&self, argv: &[&str]) -> Result<Command, TriggerError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TriggerError::ProcessFailure("empty command line".into()))?;
        if self.is_privileged() {
            let mut cmd = Command::new(program);
            cmd.args(args);
            return Ok(cmd);
        }
        self.command(&format!("echo {REMOTE_PID_PREFIX}$$; exec {}", argv.join(" ")))
    }

    /// Whether [`spawn_command`](Self::spawn_command) children run remotely.
    pub fn spawns_remotely(&self) -> bool {
        !self.is_privileged()
    }

    /// Process-table shortcut. App uids usually cannot see other uids'
    /// processes, so a miss here proves nothing.
    fn server_visible(&self) -> bool {
        let mut sys = System::new();
        process_monitor::is_process_running(&mut sys, &self.server_process)
    }

    /// `rish -c true` only succeeds while the server answers.
    fn rish_responds(&self) -> bool {
        let Some(rish) = &self.rish else {
            return false;
        };
        Command::new(rish)
            .args(["-c", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl PrivilegeChannel for ShizukuChannel {
    fn ping(&self) -> bool {
        self.is_privileged() || self.server_visible() || self.rish_responds()
    }

    fn check_permission(&self) -> Result<bool, TriggerError> {
        if !self.ping() {
            return Err(TriggerError::ServiceUnavailable(format!(
                "{} is not running",
                self.server_process
            )));
        }
        Ok(self.is_privileged() || self.rish.is_some())
    }

    fn new_process(&self, command: &str) -> Result<ProcessOutput, TriggerError> {
        let output = self
            .command(command)?
            .output()
            .map_err(|e| TriggerError::ProcessFailure(format!("spawn failed: {e}")))?;
        Ok(output.into())
    }

    fn is_installed(&self) -> bool {
        if self.rish.is_some() || self.server_visible() {
            return true;
        }
        LocalShell
            .run(&format!("pm path {SHIZUKU_PACKAGE}"))
            .map(|o| o.stdout.contains("package:"))
            .unwrap_or(false)
    }
}

/// Privilege broker client: permission checks plus command execution.
pub struct Broker<C = ShizukuChannel> {
    channel: C,
}

impl<C: PrivilegeChannel> Broker<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_running(&self) -> bool {
        self.channel.ping()
    }

    /// Liveness first: asking a dead channel for authorization fails.
    pub fn has_permission(&self) -> bool {
        if !self.channel.ping() {
            return false;
        }
        match self.channel.check_permission() {
            Ok(granted) => granted,
            Err(e) => {
                log::debug!("Cannot check broker permission: {e}");
                false
            }
        }
    }

    /// Runs `command` through the broker; `None` on any failure, including
    /// missing authorization.
    pub fn execute_command(&self, command: &str) -> Option<String> {
        self.execute(command)
    }

    /// One-line installed/running/permission summary.
    pub fn status_summary(&self) -> String {
        let installed = self.channel.is_installed();
        let running = installed && self.is_running();
        let permission = running && self.has_permission();
        format!(
            "installed: {} | running: {} | permission: {}",
            yes_no(installed),
            yes_no(running),
            yes_no(permission)
        )
    }
}

impl<C: PrivilegeChannel> CommandRunner for Broker<C> {
    fn run(&self, command: &str) -> Result<ProcessOutput, TriggerError> {
        if !self.has_permission() {
            return Err(TriggerError::PermissionDenied);
        }
        self.channel.new_process(command)
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scriptable broker channel that records what it was asked to run.
    pub(crate) struct FakeChannel {
        pub alive: bool,
        pub authorized: bool,
        pub permission_checks: Mutex<u32>,
        pub commands: Mutex<Vec<String>>,
        pub reply: fn(&str) -> Result<ProcessOutput, TriggerError>,
    }

    impl FakeChannel {
        pub(crate) fn new(alive: bool, authorized: bool) -> Self {
            Self {
                alive,
                authorized,
                permission_checks: Mutex::new(0),
                commands: Mutex::new(Vec::new()),
                reply: |_| Ok(ProcessOutput { success: true, stdout: "ok\n".into(), stderr: String::new() }),
            }
        }

        pub(crate) fn ran(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl PrivilegeChannel for FakeChannel {
        fn ping(&self) -> bool {
            self.alive
        }

        fn check_permission(&self) -> Result<bool, TriggerError> {
            *self.permission_checks.lock().unwrap() += 1;
            if !self.alive {
                return Err(TriggerError::ServiceUnavailable("dead".into()));
            }
            Ok(self.authorized)
        }

        fn new_process(&self, command: &str) -> Result<ProcessOutput, TriggerError> {
            self.commands.lock().unwrap().push(command.to_string());
            (self.reply)(command)
        }

        fn is_installed(&self) -> bool {
            true
        }
    }

    type Reply = Box<dyn Fn(&str) -> Result<ProcessOutput, TriggerError> + Send + Sync>;

    /// [`CommandRunner`] answering each command through a closure.
    pub(crate) struct RecordingRunner {
        reply: Reply,
        pub commands: Mutex<Vec<String>>,
    }

    impl RecordingRunner {
        pub(crate) fn new(
            reply: impl Fn(&str) -> Result<ProcessOutput, TriggerError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                reply: Box::new(reply),
                commands: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn ran(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, command: &str) -> Result<ProcessOutput, TriggerError> {
            self.commands.lock().unwrap().push(command.to_string());
            (self.reply)(command)
        }
    }

    pub(crate) fn stdout(text: &str) -> Result<ProcessOutput, TriggerError> {
        Ok(ProcessOutput { success: true, stdout: text.to_string(), stderr: String::new() })
    }

    // ── ProcessOutput ─────────────────────────────────────────────────────────

    #[test]
    fn combined_is_trimmed_stdout_without_stderr() {
        let out = ProcessOutput { success: true, stdout: "  true\n".into(), stderr: " \n".into() };
        assert_eq!(out.combined(), "true");
    }

    #[test]
    fn combined_labels_both_streams_with_stderr() {
        let out = ProcessOutput {
            success: false,
            stdout: "partial".into(),
            stderr: "Security exception\n".into(),
        };
        assert_eq!(out.combined(), "OUT: partial\nERR: Security exception");
    }

    // ── Broker ────────────────────────────────────────────────────────────────

    #[test]
    fn dead_channel_is_never_asked_for_permission() {
        let broker = Broker::new(FakeChannel::new(false, true));
        assert!(!broker.has_permission());
        assert_eq!(*broker.channel.permission_checks.lock().unwrap(), 0);
    }

    #[test]
    fn execute_command_without_authorization_returns_none() {
        let broker = Broker::new(FakeChannel::new(true, false));
        assert_eq!(broker.execute_command("settings get secure assistant"), None);
        assert!(broker.channel.ran().is_empty());
    }

    #[test]
    fn execute_command_on_dead_channel_returns_none() {
        let broker = Broker::new(FakeChannel::new(false, false));
        assert_eq!(broker.execute_command("id"), None);
    }

    #[test]
    fn execute_command_returns_combined_output() {
        let broker = Broker::new(FakeChannel::new(true, true));
        assert_eq!(broker.execute_command("id").as_deref(), Some("ok"));
        assert_eq!(broker.channel.ran(), vec!["id"]);
    }

    #[test]
    fn execute_command_swallows_spawn_failures() {
        let mut channel = FakeChannel::new(true, true);
        channel.reply = |_| Err(TriggerError::ProcessFailure("spawn failed".into()));
        let broker = Broker::new(channel);
        assert_eq!(broker.execute_command("id"), None);
    }

    #[test]
    fn run_reports_permission_denied() {
        let broker = Broker::new(FakeChannel::new(true, false));
        assert!(matches!(broker.run("id"), Err(TriggerError::PermissionDenied)));
    }

    #[test]
    fn status_summary_reflects_channel_state() {
        let granted = Broker::new(FakeChannel::new(true, true));
        assert_eq!(granted.status_summary(), "installed: yes | running: yes | permission: yes");
        let stopped = Broker::new(FakeChannel::new(false, true));
        assert_eq!(stopped.status_summary(), "installed: yes | running: no | permission: no");
    }

    // ── ShizukuChannel ────────────────────────────────────────────────────────

    const APP_UID: u32 = 10_123;

    fn app_channel(rish: Option<&str>) -> ShizukuChannel {
        ShizukuChannel {
            server_process: "no_such_broker_server".into(),
            rish: rish.map(|name| which::which(name).unwrap()),
            uid: APP_UID,
        }
    }

    #[cfg(unix)]
    #[test]
    fn hidden_server_is_alive_when_rish_answers() {
        // `sh -c true` stands in for a working `rish -c true`.
        let channel = app_channel(Some("sh"));
        assert!(channel.ping());
        assert!(channel.check_permission().unwrap());
        assert!(Broker::new(channel).has_permission());
    }

    #[cfg(unix)]
    #[test]
    fn failing_rish_means_dead_channel() {
        let channel = app_channel(Some("false"));
        assert!(!channel.ping());
        assert!(matches!(channel.check_permission(), Err(TriggerError::ServiceUnavailable(_))));
    }

    #[test]
    fn no_rish_and_no_server_is_dead() {
        assert!(!app_channel(None).ping());
    }

    #[test]
    fn privileged_spawn_execs_program_directly() {
        let channel = ShizukuChannel { uid: SHELL_UID, ..app_channel(None) };
        let cmd = channel.spawn_command(&["getevent", "-l"]).unwrap();
        assert_eq!(cmd.get_program(), "getevent");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), ["-l"]);
        assert!(!channel.spawns_remotely());
    }

    #[cfg(unix)]
    #[test]
    fn remote_spawn_reports_pid_first() {
        let channel = app_channel(Some("sh"));
        let cmd = channel.spawn_command(&["getevent", "-l"]).unwrap();
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            ["-c", "echo pid $$; exec getevent -l"]
        );
        assert!(channel.spawns_remotely());
    }

    #[test]
    fn spawn_without_rish_is_permission_denied() {
        assert!(matches!(
            app_channel(None).spawn_command(&["getevent", "-l"]),
            Err(TriggerError::PermissionDenied)
        ));
        assert!(app_channel(None).spawn_command(&[]).is_err());
    }

    // ── LocalShell ────────────────────────────────────────────────────────────

    #[cfg(unix)]
    #[test]
    fn local_shell_captures_both_streams() {
        let out = LocalShell.run("echo hello; echo oops 1>&2").unwrap();
        assert!(out.success);
        assert_eq!(out.combined(), "OUT: hello\n\nERR: oops");
    }
}
