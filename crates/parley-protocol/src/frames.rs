//! Line-delimited stream framing.
//!
//! Every message travels as one `data: <json>` line followed by a blank line. The
//! literal frame `data: [DONE]` terminates a request's stream and appears exactly once.

use serde_json::Value;
use thiserror::Error;

use crate::messages::Message;

/// Payload of the terminal frame.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// One decoded unit of the chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Done,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame JSON is not a known message: {0}")]
    UnknownShape(String),

    #[error("frame line exceeds {0} bytes")]
    LineTooLong(usize),
}

impl Frame {
    /// Serialize to the wire form, including the trailing blank line.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Frame::Message(message) => {
                let json = serde_json::to_string(message)?;
                Ok(format!("{DATA_PREFIX} {json}\n\n"))
            }
            Frame::Done => Ok(format!("{DATA_PREFIX} {DONE_SENTINEL}\n\n")),
        }
    }

    /// Parse the payload that follows `data:`.
    ///
    /// Accepts the bare `{"error": "..."}` wrapper as an error message so older
    /// servers that omit the tag still terminate a client's read loop cleanly.
    pub fn parse_data(data: &str) -> Result<Frame, FrameError> {
        let data = data.trim();
        if data == DONE_SENTINEL {
            return Ok(Frame::Done);
        }

        let value: Value = serde_json::from_str(data)?;
        if value.get("type").is_none() {
            if let Some(error) = value.get("error") {
                let text = match error {
                    Value::String(s) => s.clone(),
                    Value::Object(obj) => obj
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string()),
                    other => other.to_string(),
                };
                return Ok(Frame::Message(Message::error(text, None)));
            }
            let preview: String = data.chars().take(80).collect();
            return Err(FrameError::UnknownShape(preview));
        }

        Ok(Frame::Message(serde_json::from_value(value)?))
    }
}

/// Longest line [`FrameDecoder`] buffers before giving up on it.
pub const MAX_LINE_LEN: usize = 8 * 1024 * 1024;

/// Reassembles frames from arbitrarily split network chunks.
///
/// Bytes are buffered until a full line is available, so both JSON payloads and
/// multi-byte UTF-8 sequences may straddle chunk boundaries. A line longer than the
/// limit is reported once as [`FrameError::LineTooLong`] and skipped up to its newline.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    /// Dropping the rest of an oversized line.
    skipping: bool,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_LEN)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            skipping: false,
            limit,
        }
    }

    /// Feed one chunk and return every frame completed by it, in order.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Result<Frame, FrameError>> {
        let mut frames = Vec::new();

        if self.skipping {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.skipping = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return frames,
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if let Some(frame) = decode_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.limit {
            frames.push(Err(FrameError::LineTooLong(self.limit)));
            self.buffer.clear();
            self.scanned = 0;
            self.skipping = true;
        }
        frames
    }

    /// Flush a final unterminated line, if any.
    pub fn finish(&mut self) -> Option<Result<Frame, FrameError>> {
        self.skipping = false;
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<Result<Frame, FrameError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(_) => return Some(Err(FrameError::InvalidUtf8)),
    };
    let data = line.strip_prefix(DATA_PREFIX)?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    Some(Frame::parse_data(data))
}
