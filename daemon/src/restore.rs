//! Boot-time restore: once the broker is reachable, re-apply the flags and
//! hand the configured gesture back to the daemon.
//!
//! Runs on the blocking pool; every step shells out.
use std::time::{Duration, Instant};

use crate::error::TriggerError;
use crate::flags::FlagMutator;
use crate::keys::TriggerMethod;

/// Polls `ready` every `poll` until it holds or `timeout` has passed.
pub fn wait_for(ready: impl Fn() -> bool, timeout: Duration, poll: Duration) -> bool {
    let started = Instant::now();
    loop {
        if ready() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(poll);
    }
}

/// Returns the method to resume monitoring with, `None` for
/// [`TriggerMethod::None`]. Fails with `PermissionDenied` when the broker
/// never became usable.
pub fn restore(
    broker_ready: impl Fn() -> bool,
    flags: &FlagMutator,
    method: TriggerMethod,
    timeout: Duration,
    poll: Duration,
) -> Result<Option<TriggerMethod>, TriggerError> {
    log::info!("Restoring: waiting up to {}s for broker", timeout.as_secs());
    if !wait_for(broker_ready, timeout, poll) {
        log::warn!("Broker not ready after {}s; flags not restored", timeout.as_secs());
        return Err(TriggerError::PermissionDenied);
    }

    let report = flags.enable();
    log::info!("Restore: flags {}/{} applied", report.succeeded, report.attempted);

    Ok((method != TriggerMethod::None).then_some(method))
}
