// Error types for the relay and the client.
//
// Each failure class stays with the component that owns it: a
// `SessionError` only ever tears down its own session, `ChatLogError` is
// logged and swallowed after startup, and `ClientError` is what the owner of
// a `ChatClient` sees.

use std::io;
use std::net::SocketAddr;

use disclite_protocol::{FrameError, REASON_NAME_REQUIRED, REASON_NAME_TAKEN};
use thiserror::Error;

/// Failure to send on one session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("could not encode message: {0}")]
    Encode(#[source] FrameError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => SessionError::Transport(e),
            other => SessionError::Encode(other),
        }
    }
}

/// Why the registry refused a registration.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("identity is already taken")]
    NameTaken,

    #[error("identity is empty")]
    NameRequired,

    #[error("session already has an identity")]
    AlreadyRegistered,

    #[error("session is not in the registry")]
    UnknownSession,
}

impl RegisterError {
    /// Reason string sent back in `registration_response`.
    pub fn reason(&self) -> &'static str {
        match self {
            RegisterError::NameRequired => REASON_NAME_REQUIRED,
            RegisterError::NameTaken
            | RegisterError::AlreadyRegistered
            | RegisterError::UnknownSession => REASON_NAME_TAKEN,
        }
    }
}

/// Chat log persistence failures.
#[derive(Debug, Error)]
pub enum ChatLogError {
    #[error("chat log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("chat log is not a valid snapshot: {0}")]
    Format(#[from] serde_json::Error),
}

/// Failures that stop the relay from starting.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    ChatLog(#[from] ChatLogError),

    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Client-side connection failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("registration rejected: {reason}")]
    Rejected { reason: String },

    #[error("timed out waiting for registration response")]
    RegistrationTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("could not encode message: {0}")]
    Encode(#[source] FrameError),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ClientError::Transport(e),
            other => ClientError::Encode(other),
        }
    }
}
