// Newline-delimited message framing over byte streams.
//
// Wire format: each `Message` is one compact JSON object followed by `\n`.
// serde_json escapes control characters inside strings, so an encoded record
// never contains a raw line break. `read_frame` reads exactly one record per
// call from any `BufRead`, skipping blank/whitespace-only lines.
//
// Errors are split by whether the stream is still usable afterwards:
// - `Malformed` / `TooLarge`: the bad record has been consumed in full, the
//   next call starts cleanly on the following line. Callers log and go on.
// - `Io`: the transport itself failed. Callers tear the connection down.
// A peer that closes the stream yields `Frame::EndOfStream`, not an error.
//
// `MAX_FRAME_SIZE` (1 MiB) bounds one line so a peer that never sends a line
// break cannot make the reader buffer without limit.

use std::io::{self, BufRead, Read, Write};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::Message;

/// Maximum allowed frame size in bytes, excluding the line break.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Result of a successful `read_frame`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Message(Message),
    /// The peer closed the stream; no more records will arrive.
    EndOfStream,
}

/// Framing and transport failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record too large: {len} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge { len: usize },
}

impl FrameError {
    /// True if the stream can still be read after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Encode one message as a frame, including the trailing line break.
pub fn encode(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(msg)?;
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len: line.len() });
    }
    line.push(b'\n');
    Ok(line)
}

/// Decode one record (without its line break). Field names are matched
/// case-insensitively; unknown fields are ignored.
pub fn decode(record: &[u8]) -> Result<Message, FrameError> {
    let value = match serde_json::from_slice::<Value>(record)? {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

/// Write one framed message and flush.
pub fn write_frame<W: Write>(writer: &mut W, msg: &Message) -> Result<(), FrameError> {
    let frame = encode(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read the next record. Blank lines are skipped. A final record without a
/// trailing line break is still decoded; the call after it reports
/// `EndOfStream`.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let limit = MAX_FRAME_SIZE as u64 + 1;
        let read = Read::take(&mut *reader, limit).read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(Frame::EndOfStream);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        } else if line.len() > MAX_FRAME_SIZE {
            let len = line.len() + discard_line(reader)?;
            return Err(FrameError::TooLarge { len });
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return decode(&line).map(Frame::Message);
    }
}

/// Consume input up to and including the next line break. Returns the number
/// of bytes dropped before it.
fn discard_line<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut dropped = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(dropped);
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(dropped + pos);
            }
            None => {
                let len = available.len();
                reader.consume(len);
                dropped += len;
            }
        }
    }
}
