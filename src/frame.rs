//! Frame decoding for the engine's inbound event stream
//!
//! The engine emits UTF-8 text frames terminated by a line consisting of
//! exactly `---`. A frame body is:
//! - line 1: `<EventName>: <label>` - the label is informational and ignored
//! - line 2: a JSON object carrying the event parameters, optionally
//!   including the reserved boolean `__is_prefix` key
//! - lines 3+: legacy `key: value` scalar parameters
//!
//! Partial frames stay buffered across reads. Bytes are only interpreted as
//! text once a complete frame is available, so a UTF-8 sequence split across
//! two socket reads never corrupts decoding.

use bytes::{Buf, BytesMut};

use crate::protocol::{Event, ParamMap};

/// Terminator line marking the end of one frame
const TERMINATOR: &[u8] = b"---\n";

/// Reserved parameter key flagging an interceptable pre-event
const PREFIX_KEY: &str = "__is_prefix";

/// Errors from decoding a single frame
///
/// A decode error consumes only the offending frame; the decoder stays
/// usable for the frames that follow it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is empty")]
    EmptyFrame,

    #[error("frame line has no ': ' separator: {0:?}")]
    MissingSeparator(String),

    #[error("invalid parameter JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("parameter JSON is not an object")]
    NotAnObject,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// One decoded frame of the inbound stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The decoded event (name plus JSON parameter map)
    pub event: Event,
    /// Whether the engine flagged this as an interceptable pre-event
    pub is_prefix: bool,
    /// Trailing `key: value` lines; merged into the parameter map on the
    /// handler path only
    pub extras: Vec<(String, String)>,
}

/// Incremental decoder turning raw socket bytes into [`Frame`]s
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the socket
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, if its terminator has been seen
    ///
    /// Returns `Ok(None)` when more bytes are needed. On a malformed frame
    /// the offending bytes have already been consumed, so callers can log
    /// the error and keep decoding the frames behind it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let Some(pos) = find_terminator(&self.buf) else {
            return Ok(None);
        };
        let body = self.buf.split_to(pos);
        self.buf.advance(TERMINATOR.len());
        let text = std::str::from_utf8(&body)?;
        parse_frame(text.trim()).map(Some)
    }
}

/// Find the byte offset of the next terminator line
///
/// The terminator only counts at the start of a line; `---` embedded
/// mid-line is frame body.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = buf[from..]
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
    {
        let pos = from + i;
        if pos == 0 || buf[pos - 1] == b'\n' {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

/// Parse one terminator-delimited frame body
fn parse_frame(text: &str) -> Result<Frame, DecodeError> {
    let mut lines = text.lines();
    let header = lines.next().ok_or(DecodeError::EmptyFrame)?;
    let (name, _label) = header
        .split_once(": ")
        .ok_or_else(|| DecodeError::MissingSeparator(header.to_string()))?;

    let mut params = ParamMap::new();
    let mut is_prefix = false;
    if let Some(json_line) = lines.next() {
        let value: serde_json::Value = serde_json::from_str(json_line)?;
        let serde_json::Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };
        params = map;
        is_prefix = params
            .remove(PREFIX_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }

    let mut extras = Vec::new();
    for line in lines {
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| DecodeError::MissingSeparator(line.to_string()))?;
        extras.push((key.to_string(), value.to_string()));
    }

    Ok(Frame {
        event: Event {
            name: name.to_string(),
            params,
        },
        is_prefix,
        extras,
    })
}
