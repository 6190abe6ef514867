// disclite_protocol: wire protocol for the Disclite chat relay.
//
// This crate defines the message record, its type tags, and the line framing
// used by the relay (`disclite_relay`) and chat clients to talk over TCP. It
// is shared by both sides and has no networking or threading of its own.
//
// Module overview:
// - `types.rs`:    `MessageKind` (the wire `type` tag) and the fixed strings
//                  both sides agree on (server identity, rejection reasons).
// - `message.rs`:  The `Message` record, constructors for each kind, payload
//                  helpers (users list, typing state), and sender-side
//                  private-message composition.
// - `framing.rs`:  Newline-delimited JSON framing over any `BufRead`/`Write`
//                  stream, with case-insensitive field decoding and a
//                  recoverable/fatal error split.
//
// Design decisions:
// - **JSON lines.** One compact JSON object per line keeps the protocol
//   readable with `nc` and compatible with existing clients.
// - **Lenient decode.** Unknown `type` tags and unknown fields decode fine;
//   routing policy belongs to the relay, not the codec.
// - **No async runtime.** Uses `std::io` traits, compatible with blocking TCP
//   streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{
    Frame, FrameError, MAX_FRAME_SIZE, decode, encode, read_frame, write_frame,
};
pub use message::{Message, decode_users_list, encode_users_list};
pub use types::{
    MessageKind, REASON_NAME_REQUIRED, REASON_NAME_TAKEN, REGISTRATION_SUCCESS, SERVER_IDENTITY,
};
