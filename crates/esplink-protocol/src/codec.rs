//! Line codec for the esplink protocol.
//!
//! Messages are JSON objects terminated by `\n`. This module provides
//! encoding and decoding utilities plus [`LineBuffer`], which reassembles
//! lines from arbitrarily fragmented socket reads.

use crate::messages::{Command, Request, Response, ServerMessage, StatusMessage};
use serde::Serialize;
use thiserror::Error;

/// Longest accepted line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1024;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode any message as a single JSON line (without the terminator).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Encode a response.
pub fn encode_response(resp: &Response) -> Result<String, CodecError> {
    encode_message(resp)
}

/// Encode a status payload.
pub fn encode_status(status: &StatusMessage) -> Result<String, CodecError> {
    encode_message(status)
}

/// Encode a client request.
pub fn encode_request(req: &Request) -> Result<String, CodecError> {
    encode_message(req)
}

/// Decode a request line received by a device.
///
/// Only malformed JSON is an error; unknown or incomplete commands decode
/// and are rejected later by the dispatcher.
pub fn decode_command(line: &str) -> Result<Command, CodecError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    Ok(Command::from_value(value))
}

/// Decode a line received from a device.
pub fn decode_server_message(line: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(line).map_err(CodecError::from)
}

/// A received line that could not be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("line exceeds {max} bytes")]
    Overlong { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// One framed line: its text, or why it was discarded.
pub type InboundLine = Result<String, LineError>;

/// Reassembles newline-delimited lines from a byte stream.
///
/// Complete lines are returned trimmed, in arrival order; blank lines are
/// skipped. A line exceeding the limit is discarded up to its terminator
/// and reported once as [`LineError::Overlong`] when the terminator arrives,
/// so every terminated line yields exactly one item.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    /// Create a buffer accepting lines of up to `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Append received bytes and return every line completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<InboundLine> {
        let mut lines = Vec::new();

        for chunk in data.split_inclusive(|b| *b == b'\n') {
            let complete = chunk.last() == Some(&b'\n');
            let body = if complete {
                &chunk[..chunk.len() - 1]
            } else {
                chunk
            };

            if !self.discarding {
                if self.pending.len() + body.len() > self.max_len {
                    self.pending.clear();
                    self.discarding = true;
                } else {
                    self.pending.extend_from_slice(body);
                }
            }

            if complete {
                if self.discarding {
                    lines.push(Err(LineError::Overlong { max: self.max_len }));
                } else if let Some(line) = self.take_line() {
                    lines.push(line);
                }
                self.pending.clear();
                self.discarding = false;
            }
        }

        lines
    }

    fn take_line(&self) -> Option<InboundLine> {
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| Ok(text.to_string()))
            }
            Err(_) => Some(Err(LineError::InvalidUtf8)),
        }
    }

    /// Bytes buffered towards the next line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget any partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}
