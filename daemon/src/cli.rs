use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::assistant::{self, GMS_PACKAGE, GSA_PACKAGE};
use crate::broker::{Broker, CommandRunner, LocalShell, ShizukuChannel};
use crate::config::Config;
use crate::error::TriggerError;
use crate::flags::FlagMutator;
use crate::invoker::{Invoker, RemoteServiceCall};
use crate::ipc::CONNECTION;
use crate::keys::{KeyAction, TriggerMethod};
use crate::{paths, sysprop};

#[derive(Debug, Parser)]
#[command(name = "cts", version)]
#[command(about = "Circle to Search trigger daemon and control tool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the privileged trigger daemon (start through Shizuku or as root)
    Daemon,
    /// Open Circle to Search now, trying every strategy in order
    Trigger {
        /// Print one line per attempted strategy
        #[arg(long, short)]
        verbose: bool,
    },
    /// Try each known Circle to Search intent until one is accepted
    ProbeIntents,
    /// Write the feature flags and make Google the default assistant
    Enable,
    /// Remove the main feature flag
    Disable,
    /// Report broker, flag, assistant and daemon state
    Check,
    /// Control key monitoring in the running daemon
    Monitor {
        #[command(subcommand)]
        action: MonitorCommand,
    },
    /// Forward one key event to the daemon's callback recognizer
    Key {
        /// Android keycode, e.g. 25 for volume down
        code: u32,
        /// down or up
        action: KeyAction,
        #[arg(long, default_value_t = 0)]
        repeat: u32,
    },
    /// Run a shell command with broker privileges and print its output
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum MonitorCommand {
    /// Start a getevent session with the given gesture
    Start { method: TriggerMethod },
    Stop,
    /// Show the most recent key events
    Keys,
}

/// Runs every command except `daemon`, then drops any daemon connection.
pub fn run(command: Commands, config: &Config) -> Result<()> {
    let result = dispatch(command, config);
    CONNECTION.unbind();
    result
}

fn dispatch(command: Commands, config: &Config) -> Result<()> {
    let broker = Arc::new(Broker::new(ShizukuChannel::from_config(&config.broker)));
    let local: Arc<dyn CommandRunner> = Arc::new(LocalShell);

    match command {
        Commands::Daemon => bail!("`daemon` needs the async runtime; dispatch it from main"),

        Commands::Trigger { verbose } => {
            let remote = RemoteServiceCall::new(&CONNECTION, paths::socket_path(), config.broker.bind_timeout());
            let invoker = Invoker::for_client(local, broker, remote, &config.service, sysprop::sdk_int());
            let report = invoker.invoke_with_log();
            if verbose {
                for line in &report.lines {
                    println!("{line}");
                }
            }
            match report.succeeded {
                Some(name) => println!("Triggered via {name}"),
                None => bail!("All trigger strategies failed"),
            }
        }

        Commands::ProbeIntents => {
            let report = Invoker::probe_intents(local).invoke_with_log();
            for line in &report.lines {
                println!("{line}");
            }
            if !report.success() {
                bail!("No intent was accepted");
            }
        }

        Commands::Enable => {
            require_permission(&broker)?;
            let flags = FlagMutator::new(broker.clone());
            let report = flags.enable();
            println!("Flags written: {}/{}", report.succeeded, report.attempted);
            let assistant_ok = flags.assistant().set_google();
            println!("Google assistant: {}", if assistant_ok { "set" } else { "not set" });
            if !report.success() {
                bail!("No flag write succeeded");
            }
        }

        Commands::Disable => {
            require_permission(&broker)?;
            FlagMutator::new(broker.clone()).disable();
            println!("Circle to Search flag removed");
        }

        Commands::Check => check(&broker, local.as_ref(), config),

        Commands::Monitor { action } => {
            connect(config)?;
            match action {
                MonitorCommand::Start { method } => {
                    if !CONNECTION.start_monitoring(method)? {
                        bail!("Daemon could not start monitoring with {method}");
                    }
                    println!("Monitoring: {method}");
                }
                MonitorCommand::Stop => {
                    CONNECTION.stop_monitoring()?;
                    println!("Monitoring stopped");
                }
                MonitorCommand::Keys => println!("{}", CONNECTION.recent_keys()?),
            }
        }

        Commands::Key { code, action, repeat } => {
            connect(config)?;
            let consumed = CONNECTION.forward_key(code, action, repeat)?;
            println!("{}", if consumed { "consumed" } else { "passed" });
        }

        Commands::Exec { command } => {
            require_permission(&broker)?;
            let line = command.join(" ");
            match broker.execute_command(&line) {
                Some(output) => println!("{output}"),
                None => bail!("Broker could not run `{line}`"),
            }
        }
    }
    Ok(())
}

fn require_permission(broker: &Broker) -> Result<()> {
    if broker.has_permission() {
        return Ok(());
    }
    Err(TriggerError::PermissionDenied)
        .with_context(|| format!("Shizuku {}", broker.status_summary()))
}

fn connect(config: &Config) -> Result<()> {
    let socket = paths::socket_path();
    if !CONNECTION.bind(&socket, config.broker.bind_timeout()) {
        bail!("Trigger daemon is not running ({})", socket.display());
    }
    Ok(())
}

fn check(broker: &Arc<Broker>, local: &dyn CommandRunner, config: &Config) {
    let yes_no = |b: bool| if b { "yes" } else { "no" };

    println!("Shizuku: {}", broker.status_summary());
    println!(
        "SDK: {}",
        sysprop::sdk_int().map_or_else(|| "unknown".to_string(), |v| v.to_string())
    );
    println!("Google app installed: {}", yes_no(assistant::is_package_installed(local, GSA_PACKAGE)));
    println!("Play services installed: {}", yes_no(assistant::is_package_installed(local, GMS_PACKAGE)));

    if broker.has_permission() {
        let flags = FlagMutator::new(broker.clone());
        println!("Circle to Search enabled: {}", yes_no(flags.is_enabled()));
        println!(
            "Assistant: {}",
            flags.assistant().current().unwrap_or_else(|| "unset".to_string())
        );
    }

    println!(
        "Overlay: {} (height {}, offset {}{})",
        if config.overlay.enabled { "on" } else { "off" },
        config.overlay.height,
        config.overlay.effective_offset_y(),
        if config.overlay.debug_mode { ", debug" } else { "" }
    );
    if config.first_run {
        println!("Setup not completed; run `cts enable` first");
    }

    if CONNECTION.bind(&paths::socket_path(), config.broker.bind_timeout()) {
        match CONNECTION.status() {
            Ok(status) => println!("Daemon:\n{status}"),
            Err(e) => println!("Daemon: {e}"),
        }
    } else {
        println!("Daemon: not running");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trigger_flags() {
        let cli = Cli::try_parse_from(["cts", "trigger", "--verbose"]).unwrap();
        assert!(matches!(cli.command, Commands::Trigger { verbose: true }));
    }

    #[test]
    fn parses_monitor_start_method() {
        let cli = Cli::try_parse_from(["cts", "monitor", "start", "vol_down_long"]).unwrap();
        match cli.command {
            Commands::Monitor { action: MonitorCommand::Start { method } } => {
                assert_eq!(method, TriggerMethod::VolDownLong)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(Cli::try_parse_from(["cts", "monitor", "start", "power_double"]).is_err());
    }

    #[test]
    fn parses_key_with_repeat() {
        let cli = Cli::try_parse_from(["cts", "key", "25", "down", "--repeat", "3"]).unwrap();
        match cli.command {
            Commands::Key { code, action, repeat } => {
                assert_eq!((code, action, repeat), (25, KeyAction::Down, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exec_keeps_hyphenated_arguments() {
        let cli = Cli::try_parse_from(["cts", "exec", "settings", "get", "-u", "0", "secure", "assistant"]).unwrap();
        match cli.command {
            Commands::Exec { command } => assert_eq!(command.join(" "), "settings get -u 0 secure assistant"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["cts", "exec"]).is_err());
    }

    #[test]
    fn subcommand_names_are_kebab_case() {
        assert!(Cli::try_parse_from(["cts", "probe-intents"]).is_ok());
        assert!(Cli::try_parse_from(["cts", "probe_intents"]).is_err());
    }
}
