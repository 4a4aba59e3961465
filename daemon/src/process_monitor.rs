use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::event::DaemonEvent;

const POLL_INTERVAL_SECS: u64 = 2;

/// Returns true if a process named `name` is in the process table.
///
/// Refreshes `sys` first. Untrusted apps only see their own processes on
/// Android, so a negative answer from an app uid is not conclusive.
pub fn is_process_running(sys: &mut System, name: &str) -> bool {
    sys.refresh_processes(ProcessesToUpdate::All, false);
    sys.processes()
        .values()
        .any(|p| p.name().to_string_lossy() == name)
}

/// Polls the process table every [`POLL_INTERVAL_SECS`] seconds and emits
/// [`DaemonEvent::BrokerStarted`] / [`DaemonEvent::BrokerStopped`] whenever
/// the broker server process appears or disappears.
pub async fn run(server_process: String, tx: mpsc::Sender<DaemonEvent>) {
    let mut sys = System::new();
    let mut alive: Option<bool> = None;
    let mut ticker = interval(Duration::from_secs(POLL_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        let now_alive = is_process_running(&mut sys, &server_process);
        if alive == Some(now_alive) {
            continue;
        }
        alive = Some(now_alive);

        let event = if now_alive {
            log::info!("Broker process detected: {server_process}");
            DaemonEvent::BrokerStarted
        } else {
            log::warn!("Broker process not running: {server_process}");
            DaemonEvent::BrokerStopped
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_process_is_not_running() {
        let mut sys = System::new();
        assert!(!is_process_running(&mut sys, "no-such-process-cts-test"));
    }
}
