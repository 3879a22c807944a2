//! Connection sessions over the Unix domain socket.
//!
//! A [`Transport`] is shared by all I/O tasks of one instance. It holds the
//! connection state, the writer half of the current connection, and the
//! outlets towards the delivery thread and the notice channel.
//!
//! Only one connection is live at a time. The server accepts a single peer
//! and drops any extra connection attempt while that peer is attached.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::dispatch::DispatchMsg;
use crate::error::{EventsError, Result};
use crate::ipc::framing::{write_frame, FrameDecoder};
use crate::models::{ConnectionState, Notice};

/// Read buffer size for one connection.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receiving side of the instance-wide shutdown flag.
#[derive(Debug, Clone)]
pub(crate) struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown has been requested (or the flag's owner is gone).
    pub(crate) async fn wait(&mut self) {
        let _ = self.0.wait_for(|closing| *closing).await;
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Shutdown,
    PeerClosed,
    WriteFailed,
    ReadError(String),
    Corrupt(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Shutdown => f.write_str("shutdown"),
            SessionEnd::PeerClosed => f.write_str("peer closed the connection"),
            SessionEnd::WriteFailed => f.write_str("write failed"),
            SessionEnd::ReadError(e) => write!(f, "read error: {e}"),
            SessionEnd::Corrupt(e) => write!(f, "corrupt frame: {e}"),
        }
    }
}

/// Writer half of the live connection.
struct ConnWriter {
    id: u64,
    half: OwnedWriteHalf,
    /// Wakes the session's read loop when a write fails.
    kill: Arc<Notify>,
    /// Set by the session once its read side is done, aborting a blocked write.
    ended: watch::Receiver<bool>,
}

/// Shared connection context for one instance.
pub(crate) struct Transport {
    path: PathBuf,
    max_frame_size: usize,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<ConnWriter>>,
    next_conn_id: AtomicU64,
    dispatch: mpsc::UnboundedSender<DispatchMsg>,
    notices: broadcast::Sender<Notice>,
    debug: Arc<AtomicBool>,
}

impl Transport {
    pub(crate) fn new(
        path: PathBuf,
        max_frame_size: usize,
        state: watch::Sender<ConnectionState>,
        dispatch: mpsc::UnboundedSender<DispatchMsg>,
        notices: broadcast::Sender<Notice>,
        debug: Arc<AtomicBool>,
    ) -> Self {
        Self {
            path,
            max_frame_size,
            state,
            writer: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            dispatch,
            notices,
            debug,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn debug(&self) -> &AtomicBool {
        &self.debug
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` and announce it.
    ///
    /// Once closing has started only `Closed` is accepted, so a session that
    /// unwinds during shutdown cannot report `Disconnected` afterwards.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || (current.is_closed() && !next.is_closed()) {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            trace_event!(self.debug, "State {} -> {}", self.path.display(), next);
            self.notify(Notice::State(next));
        }
    }

    /// Publish a notice. Having no subscribers is fine.
    pub(crate) fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    /// Write one encoded frame to the live connection.
    ///
    /// On failure the connection is torn down so its session can report the
    /// disconnect. A write stalled on a peer that stopped reading is abandoned
    /// as soon as the session ends.
    pub(crate) async fn write(&self, frame: &[u8]) -> Result<()> {
        let mut slot = self.writer.lock().await;
        let Some(conn) = slot.as_mut() else {
            return Err(EventsError::NotConnected);
        };

        let mut ended = conn.ended.clone();
        let written = tokio::select! {
            res = write_frame(&mut conn.half, frame) => Some(res),
            _ = async { let _ = ended.wait_for(|ended| *ended).await; } => None,
        };
        match written {
            Some(Ok(())) => Ok(()),
            None => {
                tracing::debug!("Write to {} abandoned, connection ended", self.path.display());
                *slot = None;
                Err(EventsError::NotConnected)
            }
            Some(Err(e)) => {
                tracing::warn!("Write to {} failed: {}", self.path.display(), e);
                conn.kill.notify_one();
                *slot = None;
                Err(e.into())
            }
        }
    }

    /// Serve one connection until it ends.
    ///
    /// `on_ready` fires after the writer is installed and the state is
    /// `Connected`.
    pub(crate) async fn run_session(
        &self,
        stream: UnixStream,
        mut shutdown: Shutdown,
        on_ready: Option<oneshot::Sender<()>>,
    ) -> SessionEnd {
        let (mut reader, half) = stream.into_split();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let kill = Arc::new(Notify::new());
        let (ended, ended_rx) = watch::channel(false);

        *self.writer.lock().await = Some(ConnWriter {
            id,
            half,
            kill: Arc::clone(&kill),
            ended: ended_rx,
        });
        self.set_state(ConnectionState::Connected);
        if let Some(tx) = on_ready {
            let _ = tx.send(());
        }

        let end = self.read_loop(&mut reader, &kill, &mut shutdown).await;
        ended.send_replace(true);

        {
            let mut slot = self.writer.lock().await;
            if slot.as_ref().is_some_and(|conn| conn.id == id) {
                *slot = None;
            }
        }
        if end != SessionEnd::Shutdown {
            tracing::info!("Connection {} on {} ended: {}", id, self.path.display(), end);
            self.set_state(ConnectionState::Disconnected);
        }
        end
    }

    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        kill: &Notify,
        shutdown: &mut Shutdown,
    ) -> SessionEnd {
        let mut decoder = FrameDecoder::new(self.max_frame_size);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let read = tokio::select! {
                _ = shutdown.wait() => return SessionEnd::Shutdown,
                _ = kill.notified() => return SessionEnd::WriteFailed,
                res = reader.read(&mut buf) => res,
            };

            let n = match read {
                Ok(0) => return SessionEnd::PeerClosed,
                Ok(n) => n,
                Err(e) => return SessionEnd::ReadError(e.to_string()),
            };
            decoder.push(&buf[..n]);

            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        trace_event!(self.debug, "Received frame {:?}", frame.event);
                        if self.dispatch.send(DispatchMsg::Frame(frame)).is_err() {
                            tracing::debug!("Delivery thread gone, dropping frame");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Dropping connection on {}: {}", self.path.display(), e);
                        let reason = e.to_string();
                        self.notify(Notice::Error(e));
                        return SessionEnd::Corrupt(reason);
                    }
                }
            }
        }
    }

    /// Accept peers until shutdown.
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: StdUnixListener, mut shutdown: Shutdown) {
        let listener = match UnixListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Cannot register listener for {}: {}", self.path.display(), e);
                self.set_state(ConnectionState::Failed);
                self.notify(Notice::Error(e.into()));
                return;
            }
        };
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Listening on {}", self.path.display());

        let mut active: Option<JoinHandle<()>> = None;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, _)) => {
                    if active.as_ref().is_some_and(|session| !session.is_finished()) {
                        tracing::warn!(
                            "Rejecting extra peer on {}: a peer is already attached",
                            self.path.display()
                        );
                        drop(stream);
                        continue;
                    }
                    let transport = Arc::clone(&self);
                    let session_shutdown = shutdown.clone();
                    active = Some(tokio::spawn(async move {
                        transport.run_session(stream, session_shutdown, None).await;
                    }));
                }
                Err(e) => {
                    tracing::warn!("Accept on {} failed: {}", self.path.display(), e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::debug!("Accept loop for {} stopped", self.path.display());
    }
}

/// Bind the server socket at `path`.
///
/// A leftover socket file with nobody listening is removed first. A socket
/// that still accepts connections belongs to a live server and yields
/// `EventsError::AddressInUse`. The socket file is restricted to the owner.
pub(crate) fn bind(path: &Path) -> Result<StdUnixListener> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.file_type().is_socket() {
            return Err(EventsError::AddressInUse(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        match StdUnixStream::connect(path) {
            Ok(_) => {
                return Err(EventsError::AddressInUse(format!(
                    "{} has a live server",
                    path.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::info!("Removing stale socket {}", path.display());
                remove_socket(path)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let listener = StdUnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Remove a socket file, ignoring one that is already gone.
pub(crate) fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
