// TCP client for connecting to the chat relay.
//
// Gives the owning thread a non-blocking interface to the relay:
// - `connect()` performs TCP connect + `register` handshake on the calling
//   thread and fails fast if the relay rejects the identity or does not
//   answer within `registration_timeout`.
// - A background supervisor thread reads frames and pushes `ClientEvent`s
//   into an `mpsc` channel. `poll()` drains it without blocking;
//   `recv_timeout()` waits for the next event.
// - Sends go straight to the socket through a writer shared with the
//   supervisor (behind one mutex), so the supervisor can swap in a fresh
//   connection after a reconnect.
//
// Reconnect: when the connection drops without the user asking, the
// supervisor reports `Disconnected`, then retries with exponential backoff
// (`ReconnectPolicy::delay_for`). Each attempt re-registers the same
// identity. A rejection (for example the relay has not yet noticed the old
// session is gone) counts as a failed attempt. After `max_attempts`
// failures the client enters `GiveUp` and sends fail with
// `ReconnectExhausted`.
//
// `disconnect()` (also run on drop) marks the client `Disconnected` before
// shutting the socket down, which the supervisor reads as "do not
// reconnect". Dropping the cancel sender wakes a supervisor sleeping in a
// backoff delay, so shutdown never waits out the delay. A reconnect attempt
// that is already registering publishes its socket in `Conn::control` as
// soon as it connects, so `disconnect()` shuts that socket down too and the
// attempt fails at once instead of running out its registration timeout.
//
// Every client socket has a write timeout: a relay that stops reading fails
// the send (and triggers a reconnect) instead of wedging the sender while it
// holds the connection lock.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use disclite_protocol::{
    Frame, FrameError, Message, MessageKind, REGISTRATION_SUCCESS, read_frame, write_frame,
};
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// Backoff schedule for automatic reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Everything needed to (re)establish a session with the relay.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `host:port` of the relay.
    pub addr: String,
    pub identity: String,
    pub connect_timeout: Duration,
    /// Upper bound on one blocking send.
    pub write_timeout: Duration,
    /// How long to wait for `registration_response` after registering.
    pub registration_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            identity: identity.into(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(3),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Closed by the user. Terminal.
    Disconnected,
    /// A reconnect attempt is dialing and registering.
    Connecting,
    Connected,
    /// Connection lost; the supervisor is retrying.
    Reconnecting,
    /// Reconnect attempts exhausted. Terminal.
    GiveUp,
}

/// What the supervisor reports to the client's owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Message(Message),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected,
    GaveUp { attempts: u32 },
}

struct Conn {
    state: ConnectionState,
    writer: Option<BufWriter<TcpStream>>,
    control: Option<TcpStream>,
}

impl Conn {
    /// Drop the writer and shut the socket down so the supervisor's read
    /// returns.
    fn close_transport(&mut self) {
        self.writer = None;
        if let Some(control) = self.control.take() {
            let _ = control.shutdown(Shutdown::Both);
        }
    }
}

struct Shared {
    conn: Mutex<Conn>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Conn> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered connection, before it is handed to the supervisor.
struct Link {
    writer: BufWriter<TcpStream>,
    reader: BufReader<TcpStream>,
    control: TcpStream,
    /// Frames that arrived ahead of the registration response.
    backlog: Vec<Message>,
}

/// Client for one identity on one relay.
pub struct ChatClient {
    identity: String,
    max_attempts: u32,
    shared: Arc<Shared>,
    inbox: Receiver<ClientEvent>,
    cancel: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Connect, register `config.identity`, and start the supervisor thread.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let Link {
            writer,
            reader,
            control,
            backlog,
        } = establish(&config, None)?;
        info!(addr = %config.addr, identity = %config.identity, "Connected to relay");

        let shared = Arc::new(Shared {
            conn: Mutex::new(Conn {
                state: ConnectionState::Connected,
                writer: Some(writer),
                control: Some(control),
            }),
        });
        let (event_tx, inbox) = mpsc::channel();
        for msg in backlog {
            let _ = event_tx.send(ClientEvent::Message(msg));
        }
        let (cancel_tx, cancel_rx) = mpsc::channel();

        let identity = config.identity.clone();
        let max_attempts = config.reconnect.max_attempts;
        let supervisor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("chat-client-{identity}"))
                .spawn(move || supervise(config, shared, reader, event_tx, cancel_rx))
                .map_err(ClientError::Transport)?
        };

        Ok(Self {
            identity,
            max_attempts,
            shared,
            inbox,
            cancel: Some(cancel_tx),
            supervisor: Some(supervisor),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Send one message as-is.
    pub fn send(&self, msg: &Message) -> Result<(), ClientError> {
        let mut conn = self.shared.lock();
        match conn.state {
            ConnectionState::Connected => {}
            ConnectionState::GiveUp => {
                return Err(ClientError::ReconnectExhausted {
                    attempts: self.max_attempts,
                });
            }
            _ => return Err(ClientError::NotConnected),
        }
        let Some(writer) = conn.writer.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        if let Err(e) = write_frame(writer, msg) {
            // Hand the broken socket to the supervisor's reconnect path.
            if let FrameError::Io(_) = e {
                conn.close_transport();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a line of user input. `<name> text` goes privately to `name`;
    /// anything else is broadcast.
    pub fn send_text(&self, text: &str) -> Result<(), ClientError> {
        self.send(&Message::compose(self.identity.as_str(), text))
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<(), ClientError> {
        self.send(&Message::typing(self.identity.as_str(), is_typing))
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&mut self) {
        let was = {
            let mut conn = self.shared.lock();
            let was = conn.state;
            conn.state = ConnectionState::Disconnected;
            conn.close_transport();
            was
        };
        drop(self.cancel.take());
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
            debug!(identity = %self.identity, from = ?was, "Client disconnected");
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Connect to the first reachable address for `config.addr`.
fn open_stream(config: &ClientConfig) -> Result<TcpStream, ClientError> {
    let addrs: Vec<SocketAddr> = config
        .addr
        .to_socket_addrs()
        .map_err(ClientError::Connect)?
        .collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(ClientError::Connect(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
    })))
}

/// Connect and register. Returns once the relay has accepted the identity.
///
/// With `shared` set (a reconnect attempt), the new socket is published in
/// `Conn::control` before registering, and the attempt is abandoned if the
/// client has left the `Connecting` state.
fn establish(config: &ClientConfig, shared: Option<&Shared>) -> Result<Link, ClientError> {
    let stream = open_stream(config)?;
    stream
        .set_write_timeout(Some(config.write_timeout))
        .map_err(ClientError::Transport)?;
    if let Some(shared) = shared {
        let mut conn = shared.lock();
        if conn.state != ConnectionState::Connecting {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(ClientError::NotConnected);
        }
        conn.control = Some(stream.try_clone().map_err(ClientError::Transport)?);
    }
    let mut reader = BufReader::new(stream.try_clone().map_err(ClientError::Transport)?);
    let control = stream.try_clone().map_err(ClientError::Transport)?;
    let mut writer = BufWriter::new(stream);

    write_frame(&mut writer, &Message::register(config.identity.as_str()))?;

    let deadline = Instant::now() + config.registration_timeout;
    let mut backlog = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::RegistrationTimeout);
        }
        reader
            .get_ref()
            .set_read_timeout(Some(remaining))
            .map_err(ClientError::Transport)?;
        match read_frame(&mut reader) {
            Ok(Frame::Message(msg)) if msg.kind == MessageKind::RegistrationResponse => {
                if msg.body_text() == REGISTRATION_SUCCESS {
                    break;
                }
                return Err(ClientError::Rejected {
                    reason: msg.body_text().to_string(),
                });
            }
            Ok(Frame::Message(msg)) => backlog.push(msg),
            Ok(Frame::EndOfStream) => {
                return Err(ClientError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "relay closed the connection during registration",
                )));
            }
            Err(FrameError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Err(ClientError::RegistrationTimeout);
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping bad frame during registration");
            }
            Err(e) => return Err(e.into()),
        }
    }

    reader
        .get_ref()
        .set_read_timeout(None)
        .map_err(ClientError::Transport)?;
    Ok(Link {
        writer,
        reader,
        control,
        backlog,
    })
}

/// Move from `from` to `to` unless something else (a user disconnect)
/// changed the state first.
fn transition(shared: &Shared, from: ConnectionState, to: ConnectionState) -> bool {
    let mut conn = shared.lock();
    if conn.state != from {
        return false;
    }
    conn.state = to;
    true
}

/// Supervisor thread: pump frames, reconnect on loss, exit on user
/// disconnect or give-up.
fn supervise(
    config: ClientConfig,
    shared: Arc<Shared>,
    mut reader: BufReader<TcpStream>,
    events: Sender<ClientEvent>,
    cancel: Receiver<()>,
) {
    loop {
        pump(&mut reader, &events);

        let user_initiated = {
            let mut conn = shared.lock();
            if conn.state == ConnectionState::Disconnected {
                true
            } else {
                conn.state = ConnectionState::Reconnecting;
                conn.close_transport();
                false
            }
        };
        let _ = events.send(ClientEvent::Disconnected);
        if user_initiated {
            return;
        }
        warn!(identity = %config.identity, "Lost connection to relay");

        match reconnect(&config, &shared, &events, &cancel) {
            Some((next_reader, backlog)) => {
                reader = next_reader;
                for msg in backlog {
                    let _ = events.send(ClientEvent::Message(msg));
                }
            }
            None => return,
        }
    }
}

/// Forward frames until the stream ends or fails.
fn pump(reader: &mut BufReader<TcpStream>, events: &Sender<ClientEvent>) {
    loop {
        match read_frame(reader) {
            Ok(Frame::Message(msg)) => {
                let _ = events.send(ClientEvent::Message(msg));
            }
            Ok(Frame::EndOfStream) => {
                debug!("Relay closed the connection");
                return;
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping bad frame from relay");
            }
            Err(e) => {
                debug!(error = %e, "Read from relay failed");
                return;
            }
        }
    }
}

/// Retry with backoff. Returns the new read half (plus any early frames) on
/// success, or `None` if cancelled or out of attempts.
fn reconnect(
    config: &ClientConfig,
    shared: &Shared,
    events: &Sender<ClientEvent>,
    cancel: &Receiver<()>,
) -> Option<(BufReader<TcpStream>, Vec<Message>)> {
    let policy = &config.reconnect;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        let _ = events.send(ClientEvent::Reconnecting { attempt, delay });
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        match cancel.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Reconnect cancelled");
                return None;
            }
        }

        if !transition(shared, ConnectionState::Reconnecting, ConnectionState::Connecting) {
            return None;
        }
        match establish(config, Some(shared)) {
            Ok(Link {
                writer,
                reader,
                control,
                backlog,
            }) => {
                let mut conn = shared.lock();
                if conn.state != ConnectionState::Connecting {
                    let _ = control.shutdown(Shutdown::Both);
                    return None;
                }
                conn.state = ConnectionState::Connected;
                conn.writer = Some(writer);
                conn.control = Some(control);
                drop(conn);

                info!(attempt, identity = %config.identity, "Reconnected to relay");
                let _ = events.send(ClientEvent::Reconnected);
                return Some((reader, backlog));
            }
            Err(e) => {
                let mut conn = shared.lock();
                if conn.state != ConnectionState::Connecting {
                    debug!(attempt, error = %e, "Reconnect attempt abandoned");
                    return None;
                }
                conn.state = ConnectionState::Reconnecting;
                conn.close_transport();
                drop(conn);
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }

    if !transition(shared, ConnectionState::Reconnecting, ConnectionState::GiveUp) {
        return None;
    }
    warn!(attempts = policy.max_attempts, "Giving up on relay");
    let _ = events.send(ClientEvent::GaveUp {
        attempts: policy.max_attempts,
    });
    None
}
