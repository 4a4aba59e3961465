/// Failure taxonomy shared by every trigger strategy and the broker client.
///
/// None of these are fatal: strategies log them and fall through to the next
/// one, and only `PermissionDenied` is surfaced to the user directly.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The privileged channel is alive but this caller is not authorized.
    #[error("privileged channel not authorized")]
    PermissionDenied,
    /// The remote handle or system service is missing, or the connection dropped.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The hidden method rejected the call (signature or transaction mismatch).
    #[error("hidden call failed: {0}")]
    ReflectionFailure(String),
    /// A child process could not be spawned or exited abnormally.
    #[error("process failure: {0}")]
    ProcessFailure(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
