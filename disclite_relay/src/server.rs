// TCP listener and per-connection reader threads for the relay.
//
// Architecture: thread-per-reader, no central event loop.
//
// - **Accept thread**: polls a non-blocking `TcpListener`, checking the
//   `keep_running` flag between attempts. Each accepted stream becomes a
//   `Session`, is inserted into the registry unnamed, and gets its own
//   reader thread.
// - **Reader threads** (one per session): call `read_frame()` in a loop and
//   hand each decoded message to `Router::dispatch`, which writes directly
//   to the recipients' sockets. A malformed line is logged and skipped; EOF
//   or a transport error ends the loop. Every exit path runs
//   `Router::teardown` exactly once for that session.
//
// Writers never share a socket unsynchronized: each session's write half
// sits behind its own mutex (see `session.rs`), so concurrent broadcasts
// from different reader threads interleave whole frames only.
//
// Shutdown: `RelayHandle::stop` (or dropping the handle) clears
// `keep_running`, joins the accept thread, then closes every session. Closed
// sockets unblock their reader threads, which tear themselves down.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use disclite_protocol::{Frame, read_frame};
use tracing::{debug, info, warn};

use crate::chat_log::{ChatLog, ChatLogEntry};
use crate::error::RelayError;
use crate::registry::Registry;
use crate::router::{Dispatch, Router};
use crate::session::Session;

/// How long the accept thread sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CHAT_LOG: &str = "chat_log.json";

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Snapshot file for the chat log. `None` keeps the log in memory only.
    pub chat_log_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            chat_log_path: Some(DEFAULT_CHAT_LOG.into()),
        }
    }
}

/// Handle returned by `start_relay` to inspect and control the running
/// server. Dropping it stops the relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    router: Arc<Router>,
    local_addr: SocketAddr,
}

impl RelayHandle {
    /// Signal the relay to stop, wait for the accept thread, and close every
    /// session.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.keep_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let sessions = self.router.registry().all_sessions();
        info!(sessions = sessions.len(), "Relay stopping");
        for session in sessions {
            session.close();
        }
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identities of all registered sessions, sorted case-insensitively.
    pub fn online_users(&self) -> Vec<String> {
        self.router.registry().identities()
    }

    /// Every logged message, oldest first.
    pub fn chat_history(&self) -> Vec<ChatLogEntry> {
        self.router.chat_log().entries()
    }

    /// Force-close the session holding `identity` (case-insensitive).
    /// Returns false if nobody by that name is online. The session's reader
    /// thread performs the usual teardown and leave notification.
    pub fn disconnect_user(&self, identity: &str) -> bool {
        match self.router.registry().find_by_name(identity) {
            Some(session) => {
                info!(session = %session.id(), identity = %identity, "Disconnecting user");
                session.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the relay on a background accept thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let chat_log = match &config.chat_log_path {
        Some(path) => ChatLog::open(path)?,
        None => ChatLog::in_memory(),
    };

    let listener = TcpListener::bind(config.bind_addr).map_err(|source| RelayError::Bind {
        addr: config.bind_addr,
        source,
    })?;
    let local_addr = listener.local_addr()?;
    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true)?;

    let router = Arc::new(Router::new(Arc::new(Registry::new()), Arc::new(chat_log)));
    let keep_running = Arc::new(AtomicBool::new(true));

    let accept_thread = {
        let router = router.clone();
        let keep_running = keep_running.clone();
        thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || accept_loop(listener, router, keep_running))?
    };
    info!(addr = %local_addr, "Relay listening");

    Ok((
        RelayHandle {
            keep_running,
            accept_thread: Some(accept_thread),
            router,
            local_addr,
        },
        local_addr,
    ))
}

fn accept_loop(listener: TcpListener, router: Arc<Router>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = spawn_session(stream, &router) {
                    warn!(peer = %peer, error = %e, "Failed to set up session");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Accept loop exited");
}

/// Register a freshly accepted stream and start its reader thread.
fn spawn_session(stream: TcpStream, router: &Arc<Router>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let (session, reader) = Session::accept(stream)?;
    let session = Arc::new(session);
    router.registry().insert(session.clone());
    info!(session = %session.id(), peer = %session.remote_addr(), "Accepted connection");

    let spawned = {
        let router = router.clone();
        let session = session.clone();
        thread::Builder::new()
            .name(format!("relay-session-{}", session.id()))
            .spawn(move || reader_loop(reader, session, router))
    };
    if let Err(e) = spawned {
        router.registry().remove(session.id());
        session.close();
        return Err(e);
    }
    Ok(())
}

/// Reader loop for a single session. Runs in its own thread until the peer
/// disconnects, the transport fails, or the router asks to close.
fn reader_loop(mut reader: BufReader<TcpStream>, session: Arc<Session>, router: Arc<Router>) {
    loop {
        match read_frame(&mut reader) {
            Ok(Frame::Message(msg)) => {
                if router.dispatch(&session, msg) == Dispatch::Close {
                    break;
                }
            }
            Ok(Frame::EndOfStream) => {
                debug!(session = %session.id(), "Peer closed connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(session = %session.id(), error = %e, "Skipping bad frame");
            }
            Err(e) => {
                if !session.is_closed() {
                    warn!(session = %session.id(), error = %e, "Read failed");
                }
                break;
            }
        }
    }
    router.teardown(&session);
}
