//! Remote trigger service: a line-based request/response protocol over a
//! Unix domain socket.
//!
//! A client writes one request per line. Every reply is a decimal byte count
//! on its own line followed by exactly that many bytes, so multi-line
//! payloads such as the recent key list need no escaping. Connections stay
//! open for any number of requests.
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

use crate::error::TriggerError;
use crate::event::DaemonEvent;
use crate::keys::{KeyAction, TriggerMethod};

const BIND_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound on a single reply; anything larger is a framing error.
const MAX_REPLY_LEN: usize = 64 * 1024;
/// Longest request line the server reads, newline included.
const MAX_REQUEST_LEN: u64 = 4096;
const ROOT_UID: u32 = 0;
const SHELL_UID: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `triggerNow`
    Trigger,
    /// `startMonitoring(method)`
    Start(TriggerMethod),
    /// `stopMonitoring`
    Stop,
    /// `getRecentKeys`
    Keys,
    /// A key event forwarded from the OS key callback.
    Key {
        code: u32,
        action: KeyAction,
        repeat: u32,
    },
    Status,
}

impl Request {
    pub fn parse(line: &str) -> Result<Request, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty request")?;
        let request = match verb {
            "trigger" => Request::Trigger,
            "stop" => Request::Stop,
            "keys" => Request::Keys,
            "status" => Request::Status,
            "start" => {
                let method = words.next().ok_or("start needs a method")?;
                Request::Start(method.parse::<TriggerMethod>().map_err(|e| e.to_string())?)
            }
            "key" => {
                let code = words
                    .next()
                    .ok_or("key needs a keycode")?
                    .parse::<u32>()
                    .map_err(|_| "keycode must be a number")?;
                let action = words.next().ok_or("key needs an action")?.parse::<KeyAction>()?;
                let repeat = match words.next() {
                    Some(r) => r.parse::<u32>().map_err(|_| "repeat must be a number")?,
                    None => 0,
                };
                Request::Key { code, action, repeat }
            }
            other => return Err(format!("unknown request '{other}'")),
        };
        match words.next() {
            Some(extra) => Err(format!("unexpected argument '{extra}'")),
            None => Ok(request),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Trigger => f.write_str("trigger"),
            Request::Start(method) => write!(f, "start {method}"),
            Request::Stop => f.write_str("stop"),
            Request::Keys => f.write_str("keys"),
            Request::Key { code, action, repeat } => {
                write!(f, "key {code} {} {repeat}", action.as_str().to_ascii_lowercase())
            }
            Request::Status => f.write_str("status"),
        }
    }
}

fn frame(payload: &str) -> String {
    format!("{}\n{payload}", payload.len())
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Uids the server talks to, checked against each connection's peer
/// credentials.
#[derive(Debug, Clone)]
pub struct PeerAccess {
    uids: Vec<u32>,
    open: bool,
}

impl PeerAccess {
    /// Root, shell and the daemon's own uid, plus `extra`.
    pub fn for_daemon(extra: &[u32]) -> Self {
        let own = nix::unistd::getuid().as_raw();
        let mut uids = vec![ROOT_UID, SHELL_UID, own];
        uids.extend_from_slice(extra);
        Self { uids, open: !extra.is_empty() }
    }

    pub fn allows(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    /// Owner and group only, unless app uids were allowed in.
    pub fn socket_mode(&self) -> u32 {
        if self.open {
            0o666
        } else {
            0o660
        }
    }
}

/// Binds the service socket with `mode`, replacing a stale one left by a
/// previous run.
pub fn bind_listener(path: &Path, mode: u32) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    log::info!("Trigger service listening on {} ({mode:o})", path.display());
    Ok(listener)
}

/// Accepts connections forever, handing each request from an allowed peer
/// to the daemon event loop as [`DaemonEvent::Remote`].
pub async fn serve(listener: UnixListener, access: PeerAccess, tx: mpsc::Sender<DaemonEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match stream.peer_cred() {
                Ok(cred) if access.allows(cred.uid()) => {
                    tokio::spawn(handle_connection(stream, tx.clone()));
                }
                Ok(cred) => {
                    log::warn!("Refusing trigger service client uid {}", cred.uid());
                    tokio::spawn(refuse(stream));
                }
                Err(e) => log::warn!("Cannot read peer credentials: {e}"),
            },
            Err(e) => {
                log::warn!("Accept failed: {e}");
                tokio::time::sleep(BIND_POLL_INTERVAL).await;
            }
        }
    }
}

async fn refuse(mut stream: tokio::net::UnixStream) {
    let _ = stream.write_all(frame("error: permission denied").as_bytes()).await;
}

async fn handle_connection(stream: tokio::net::UnixStream, tx: mpsc::Sender<DaemonEvent>) {
    let (read, mut write) = stream.into_split();
    let mut reader = AsyncBufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        let len = match (&mut reader).take(MAX_REQUEST_LEN).read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Client read failed: {e}");
                break;
            }
        };
        if len as u64 == MAX_REQUEST_LEN && !line.ends_with('\n') {
            log::warn!("Dropping client after an oversized request");
            let _ = write.write_all(frame("error: request too long").as_bytes()).await;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let reply = match Request::parse(&line) {
            Ok(request) => {
                log::debug!("Remote request: {request}");
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(DaemonEvent::Remote(request, reply_tx)).await.is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
            Err(e) => format!("error: {e}"),
        };

        if let Err(e) = write.write_all(frame(&reply).as_bytes()).await {
            log::debug!("Client write failed: {e}");
            break;
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Connection {
    fn open(path: &Path) -> io::Result<Self> {
        let writer = UnixStream::connect(path)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { reader, writer })
    }

    fn round_trip(&mut self, request: &Request) -> io::Result<String> {
        writeln!(self.writer, "{request}")?;
        self.writer.flush()?;

        let mut header = String::new();
        if self.reader.read_line(&mut header)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "service closed the connection"));
        }
        let len: usize = header
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("bad length line {header:?}")))?;
        if len > MAX_REPLY_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("reply of {len} bytes")));
        }
        let mut payload = vec![0; len];
        self.reader.read_exact(&mut payload)?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }
}

/// Process-wide slot for the connection to the privileged trigger service.
///
/// Holds at most one connection. Any transport error empties the slot, the
/// same as the remote end going away.
pub struct ConnectionSlot {
    inner: Mutex<Option<Connection>>,
}

/// The shared connection used by every caller in this process.
pub static CONNECTION: ConnectionSlot = ConnectionSlot::new();

impl ConnectionSlot {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Connects to `path`, retrying every 100 ms until `timeout` has passed.
    /// Returns true if a connection is (or already was) held.
    pub fn bind(&self, path: &Path, timeout: Duration) -> bool {
        if self.is_bound() {
            return true;
        }
        let started = Instant::now();
        loop {
            match Connection::open(path) {
                Ok(conn) => {
                    if let Ok(mut slot) = self.inner.lock() {
                        *slot = Some(conn);
                    }
                    log::info!("Connected to trigger service at {}", path.display());
                    return true;
                }
                Err(e) if started.elapsed() >= timeout => {
                    log::debug!("Trigger service not reachable at {}: {e}", path.display());
                    return false;
                }
                Err(_) => std::thread::sleep(BIND_POLL_INTERVAL),
            }
        }
    }

    pub fn unbind(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn request(&self, request: &Request) -> Result<String, TriggerError> {
        let mut slot = self
            .inner
            .lock()
            .map_err(|_| TriggerError::ServiceUnavailable("connection lock poisoned".into()))?;
        let conn = slot
            .as_mut()
            .ok_or_else(|| TriggerError::ServiceUnavailable("trigger service not bound".into()))?;

        match conn.round_trip(request) {
            Ok(reply) => match reply.strip_prefix("error: ") {
                Some(message) => Err(TriggerError::ReflectionFailure(message.to_string())),
                None => Ok(reply),
            },
            Err(e) => {
                *slot = None;
                log::warn!("Trigger service connection lost: {e}");
                Err(TriggerError::ServiceUnavailable(format!("connection lost: {e}")))
            }
        }
    }

    pub fn trigger_now(&self) -> Result<bool, TriggerError> {
        Ok(self.request(&Request::Trigger)? == "true")
    }

    pub fn start_monitoring(&self, method: TriggerMethod) -> Result<bool, TriggerError> {
        Ok(self.request(&Request::Start(method))? == "true")
    }

    pub fn stop_monitoring(&self) -> Result<(), TriggerError> {
        self.request(&Request::Stop).map(drop)
    }

    pub fn recent_keys(&self) -> Result<String, TriggerError> {
        self.request(&Request::Keys)
    }

    /// Returns whether the daemon consumed the key.
    pub fn forward_key(&self, code: u32, action: KeyAction, repeat: u32) -> Result<bool, TriggerError> {
        Ok(self.request(&Request::Key { code, action, repeat })? == "true")
    }

    pub fn status(&self) -> Result<String, TriggerError> {
        self.request(&Request::Status)
    }
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self::new()
    }
}
