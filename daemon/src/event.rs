use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::TriggerError;
use crate::ipc::Request;
use crate::keys::TriggerMethod;

/// Where a trigger request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// `triggerNow` over the remote trigger service.
    Remote,
    /// Key events forwarded from the OS key callback.
    KeyCallback,
    /// The raw `getevent` stream.
    KeyStream,
}

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The broker server process appeared.
    BrokerStarted,
    /// The broker server process disappeared.
    BrokerStopped,
    /// A recognized gesture asks for the hidden call to be invoked.
    TriggerRequested(TriggerSource),
    /// An invocation finished; `strategy` names the attempt that worked.
    TriggerFinished {
        source: TriggerSource,
        strategy: Option<&'static str>,
    },
    /// A request from a remote trigger service client.
    Remote(Request, oneshot::Sender<String>),
    /// Boot restore finished; `Some` carries the method to resume monitoring with.
    Restored(Result<Option<TriggerMethod>, TriggerError>),
    /// The `getevent` reader process for this session ended on its own.
    MonitorExited(u64),
    /// Ctrl+C received; the daemon should stop monitoring and exit.
    Shutdown,
}
