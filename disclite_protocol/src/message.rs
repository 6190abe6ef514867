// The chat `Message` record and its payload helpers.
//
// One `Message` is one wire record. Field names on the wire are `type`, `to`,
// `from`, `package` (the body) and `timestamp`; optional fields are omitted
// when absent so an encode/decode round trip keeps them absent. Decoding is
// lenient in the ways older clients need: unknown fields are ignored, a
// missing `type` becomes `MessageKind::Unknown`, and a timestamp without a
// UTC offset is read as UTC. (Case-insensitive field names are handled one
// level up, in `framing::decode`.)
//
// Payload conventions live here too:
// - `users_list` bodies are a JSON array of identities (comma-separated
//   lists are accepted on decode, as early clients sent them).
// - `typing` bodies are the literal strings `"true"` / `"false"`.
// - `Message::compose` turns typed input like `<bob> hi` into a private
//   message on the sending side. The relay never parses body text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageKind, SERVER_IDENTITY};

/// One chat protocol record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(rename = "package", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "lenient_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(kind: MessageKind, from: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            ..Self::default()
        }
    }

    /// Registration request for `identity`.
    pub fn register(identity: impl Into<String>) -> Self {
        Self::new(MessageKind::Register, identity)
    }

    /// Broadcast chat.
    pub fn chat(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::new(MessageKind::Chat, from)
        }
    }

    /// Private message to `to`.
    pub fn private(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: Some(to.into()),
            body: Some(body.into()),
            ..Self::new(MessageKind::Private, from)
        }
    }

    /// Typing indicator.
    pub fn typing(from: impl Into<String>, is_typing: bool) -> Self {
        Self {
            body: Some(is_typing.to_string()),
            ..Self::new(MessageKind::Typing, from)
        }
    }

    /// Server notice.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            body: Some(text.into()),
            ..Self::new(MessageKind::System, SERVER_IDENTITY)
        }
    }

    /// Roster of named sessions.
    pub fn users_list(identities: &[String]) -> Self {
        Self {
            body: Some(encode_users_list(identities)),
            ..Self::new(MessageKind::UsersList, SERVER_IDENTITY)
        }
    }

    /// Outcome of a registration: `REGISTRATION_SUCCESS` or a reason.
    pub fn registration_response(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::new(MessageKind::RegistrationResponse, SERVER_IDENTITY)
        }
    }

    /// Build the outgoing message for a line of user input. `<name> text`
    /// addresses `name` privately; anything else is a broadcast.
    pub fn compose(from: impl Into<String>, text: &str) -> Self {
        match split_private_target(text) {
            Some((to, body)) => Self::private(from, to, body),
            None => Self::chat(from, text),
        }
    }

    /// Builder-style timestamp setter.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The private target, if `to` is present and not blank.
    pub fn target(&self) -> Option<&str> {
        self.to.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Body text, empty when absent.
    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    /// For `typing` messages: the carried state, if the body is a boolean.
    pub fn typing_state(&self) -> Option<bool> {
        match self.body_text().trim() {
            b if b.eq_ignore_ascii_case("true") => Some(true),
            b if b.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// For `users_list` messages: the listed identities.
    pub fn users(&self) -> Vec<String> {
        decode_users_list(self.body_text())
    }
}

/// Split `<name> rest` into `(name, rest)`. Only the first `>` closes the
/// name, and a name containing `<` is not a target.
fn split_private_target(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim_start().strip_prefix('<')?;
    let close = rest.find('>')?;
    let name = rest[..close].trim();
    if name.is_empty() || name.contains('<') {
        return None;
    }
    Some((name, rest[close + 1..].trim_start()))
}

/// Serialize identities as a `users_list` body (JSON array).
pub fn encode_users_list(identities: &[String]) -> String {
    serde_json::to_string(identities).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a `users_list` body. Accepts a JSON array, or a comma-separated
/// list as a fallback. Empty entries are dropped.
pub fn decode_users_list(body: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(body) {
        Ok(users) => users,
        Err(_) => body
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect(),
    }
}

/// RFC 3339 on the way out; on the way in also accepts ISO-8601 without an
/// offset (taken as UTC).
mod lenient_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
    }
}
