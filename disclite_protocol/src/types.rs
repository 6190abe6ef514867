// Message type tags for the chat protocol.
//
// `MessageKind` is the value of the wire-level `type` field. Decoding never
// fails on the tag itself: a missing or unrecognized tag becomes
// `MessageKind::Unknown` carrying the original text, and the relay's router
// decides what to do with it. Tag matching is ASCII case-insensitive; the
// canonical spelling is always lowercase on the way out.
//
// Also holds the fixed strings the relay and clients agree on (server
// identity, registration reasons).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `from` value of every server-originated message.
pub const SERVER_IDENTITY: &str = "server";

/// `registration_response` body for an accepted registration.
pub const REGISTRATION_SUCCESS: &str = "success";

/// Rejection reason when the identity is already held by another session.
pub const REASON_NAME_TAKEN: &str = "username taken";

/// Rejection reason for an empty or whitespace-only identity.
pub const REASON_NAME_REQUIRED: &str = "username required";

/// The `type` of a chat protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Claim a display name for this connection.
    Register,
    /// Broadcast chat, or private when `to` is non-empty.
    Chat,
    /// Private message to exactly one identity.
    Private,
    /// Ephemeral typing indicator (`"true"` / `"false"` body).
    Typing,
    /// Server notice (joins, leaves).
    System,
    /// Full roster of named sessions.
    UsersList,
    /// Outcome of a `register` request.
    RegistrationResponse,
    /// Missing or unrecognized tag, kept verbatim.
    Unknown(String),
}

impl MessageKind {
    /// Canonical wire spelling.
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Chat => "chat",
            MessageKind::Private => "private",
            MessageKind::Typing => "typing",
            MessageKind::System => "system",
            MessageKind::UsersList => "users_list",
            MessageKind::RegistrationResponse => "registration_response",
            MessageKind::Unknown(tag) => tag,
        }
    }

    /// Parse a wire tag. Never fails.
    pub fn parse(tag: &str) -> Self {
        const KNOWN: [MessageKind; 7] = [
            MessageKind::Register,
            MessageKind::Chat,
            MessageKind::Private,
            MessageKind::Typing,
            MessageKind::System,
            MessageKind::UsersList,
            MessageKind::RegistrationResponse,
        ];
        KNOWN
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag.trim()))
            .unwrap_or_else(|| MessageKind::Unknown(tag.to_string()))
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Unknown(String::new())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = Option::<String>::deserialize(deserializer)?;
        Ok(tag.map(|t| MessageKind::parse(&t)).unwrap_or_default())
    }
}
