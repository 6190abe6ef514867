// disclite_relay: chat relay server and client connection for disclite.
//
// The relay is a thin message broker: clients connect over TCP, register a
// display name, then exchange broadcast chat, private messages, and typing
// indicators. The relay routes each message by type and keeps an
// append-only chat log. It holds no other state.
//
// Module overview:
// - `session.rs`:   One live connection: identity, write half, close.
// - `registry.rs`:  The shared session table with case-insensitive name
//                   uniqueness. The only cross-thread mutable state besides
//                   the chat log.
// - `router.rs`:    Per-message routing decisions and concurrent fan-out.
// - `chat_log.rs`:  Relayed messages in memory, snapshotted to a JSON file.
// - `server.rs`:    Accept thread and one reader thread per session.
// - `client.rs`:    `ChatClient`, the client-side connection with
//                   register handshake and backoff reconnect.
// - `error.rs`:     Error types for all of the above.
//
// Dependencies: `disclite_protocol` (message types and framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_relay`).

pub mod chat_log;
pub mod client;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use chat_log::{ChatLog, ChatLogEntry};
pub use client::{ChatClient, ClientConfig, ClientEvent, ConnectionState, ReconnectPolicy};
pub use error::{ChatLogError, ClientError, RegisterError, RelayError, SessionError};
pub use server::{RelayConfig, RelayHandle, start_relay};
