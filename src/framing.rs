//! Incremental decoding of the upstream event stream.
//!
//! The upstream speaks newline-delimited `text/event-stream` lines in three
//! classes: a literal end-of-turn sentinel, `error: `-prefixed lines, and
//! `data: `-prefixed JSON payloads. Bytes arrive in arbitrary chunks, so the
//! decoder buffers until a full line is available. Splitting happens only at
//! `\n`, which keeps multi-byte characters intact even when a read chunk ends
//! mid-character.

use bytes::Bytes;

/// End-of-turn sentinel as it appears on the wire.
pub const DONE_LINE: &str = "data: DONE";
pub const DATA_PREFIX: &str = "data: ";
pub const ERROR_PREFIX: &str = "error: ";

/// Append-bytes / yield-complete-lines buffer. Carries the unterminated
/// remainder forward between reads.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &Bytes) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete line, without its terminator. `\r\n` is
    /// normalized to `\n`. Returns `None` until a full line has arrived.
    pub fn next_line(&mut self) -> Option<String> {
        let nl = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes still waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// One classified line of the upstream stream.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine<'a> {
    /// Blank line, skipped.
    Empty,
    /// The literal completion sentinel.
    Done,
    /// An upstream error line, forwarded to the caller verbatim.
    ErrorPassthrough,
    /// The JSON payload of a data line (prefix already stripped). Upstream
    /// occasionally emits bare JSON without the prefix; treated the same.
    Data(&'a str),
}

pub fn classify_line(line: &str) -> StreamLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StreamLine::Empty;
    }
    if trimmed == DONE_LINE {
        return StreamLine::Done;
    }
    if trimmed.starts_with(ERROR_PREFIX) {
        return StreamLine::ErrorPassthrough;
    }
    match trimmed.strip_prefix(DATA_PREFIX) {
        Some(payload) => StreamLine::Data(payload),
        None => StreamLine::Data(trimmed),
    }
}

/// Persistence failures surface on the open stream as an error line that a
/// client can tell apart from an upstream `error: ` passthrough.
pub fn persistence_error_line(message: &str) -> String {
    format!(
        "error: {}\n",
        serde_json::json!({ "persistenceFailed": true, "message": message })
    )
}

pub fn data_line(payload: &serde_json::Value) -> String {
    format!("{}{}\n", DATA_PREFIX, payload)
}
