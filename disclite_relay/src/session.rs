// Per-connection state for the relay.
//
// A `Session` wraps one accepted `TcpStream`. It owns the write half (behind
// its own mutex, so concurrent broadcasters serialize whole frames) and a
// control handle used to shut the socket down. The read half is handed back
// separately from `Session::accept` and driven by the connection's reader
// thread in `server.rs`.
//
// Identity: absent until the registry accepts a registration, then fixed for
// the rest of the session's life (`OnceLock`). Only `Registry::try_register`
// sets it, under the registry lock, so the name index and the session never
// disagree.
//
// Closing: `close()` is idempotent and may be called from the reader thread's
// teardown, from a failed broadcast, or from the relay's shutdown sweep.
// Shutting the socket down unblocks the reader thread, which then runs the
// normal teardown path.

use std::fmt;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use disclite_protocol::{Message, write_frame};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Upper bound on a single blocking write. A peer that stops reading for
/// longer than this fails the send instead of stalling its broadcaster.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay-assigned connection ID. Random, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One live client connection.
pub struct Session {
    id: SessionId,
    identity: OnceLock<String>,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
    closed: AtomicBool,
}

impl Session {
    /// Wrap an accepted stream. Returns the session and the buffered read
    /// half for the connection's reader thread.
    pub fn accept(stream: TcpStream) -> io::Result<(Self, BufReader<TcpStream>)> {
        let remote_addr = stream.peer_addr()?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        let control = stream.try_clone()?;
        let session = Self {
            id: SessionId::new(),
            identity: OnceLock::new(),
            remote_addr,
            connected_at: Utc::now(),
            writer: Mutex::new(BufWriter::new(stream)),
            control,
            closed: AtomicBool::new(false),
        };
        Ok((session, reader))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Registered display name, if registration has succeeded.
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn is_named(&self) -> bool {
        self.identity.get().is_some()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the identity. Returns false if one was already set. Called only
    /// by the registry while it holds its lock.
    pub(crate) fn set_identity(&self, identity: String) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// Serialize and write one frame.
    pub fn send(&self, msg: &Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, msg)?;
        Ok(())
    }

    /// Shut the transport down. Returns true only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Already-disconnected sockets report NotConnected here; nothing to do.
        let _ = self.control.shutdown(Shutdown::Both);
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity())
            .field("remote_addr", &self.remote_addr)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use disclite_protocol::{Frame, read_frame};

    use super::test_support::{recv, session_pair};
    use super::*;

    #[test]
    fn send_writes_one_frame() {
        let (session, mut client) = session_pair();
        session.send(&Message::chat("alice", "hello")).unwrap();
        assert_eq!(recv(&mut client), Message::chat("alice", "hello"));
    }

    #[test]
    fn identity_is_set_once() {
        let (session, _client) = session_pair();
        assert!(!session.is_named());
        assert!(session.set_identity("alice".into()));
        assert!(!session.set_identity("mallory".into()));
        assert_eq!(session.identity(), Some("alice"));
    }

    #[test]
    fn close_is_idempotent() {
        let (session, mut client) = session_pair();
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert!(matches!(
            session.send(&Message::system("x")),
            Err(SessionError::Closed)
        ));
        // The peer sees a clean end of stream.
        assert!(matches!(read_frame(&mut client), Ok(Frame::EndOfStream)));
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ca) = session_pair();
        let (b, _cb) = session_pair();
        assert_ne!(a.id(), b.id());
    }
}
