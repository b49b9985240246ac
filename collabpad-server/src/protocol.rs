//! Wire framing and the server-to-client event vocabulary.
//!
//! The wire protocol is newline-delimited JSON over TCP: one JSON object per
//! line, UTF-8 encoded. [`Framer`] turns a raw byte stream into parsed
//! records; [`ServerEvent`] is everything the server ever sends back.

use serde::Serialize;
use serde_json::Value;

use crate::patch::{ErrorCode, Patch};

/// Hard cap on a single newline-terminated record, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Error returned by [`Framer::feed`] for framing-level failures. Both
/// variants are reported to the client as `ERROR{code:BAD_JSON}` and the
/// session is terminated; the distinction only matters for server-side logs.
#[derive(Debug)]
pub enum FramerError {
    Oversize,
    BadJson(String),
}

impl std::fmt::Display for FramerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramerError::Oversize => write!(f, "message exceeds max size"),
            FramerError::BadJson(msg) => write!(f, "bad json: {msg}"),
        }
    }
}

impl std::error::Error for FramerError {}

/// Splits a byte stream into newline-terminated JSON records.
///
/// Holds exactly the unterminated tail between calls to [`feed`](Self::feed);
/// a record is never emitted until its terminating `\n` has arrived.
pub struct Framer {
    buffer: Vec<u8>,
    max_message_bytes: usize,
}

impl Framer {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { buffer: Vec::new(), max_message_bytes }
    }

    /// Feeds a new chunk of bytes and returns every record completed by it,
    /// in order. A malformed or oversize buffer fails the whole call; the
    /// caller must terminate the session afterwards.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>, FramerError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_message_bytes {
            return Err(FramerError::Oversize);
        }

        let mut records = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            let line = trim_ascii(&line[..line.len() - 1]);
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_slice(line)
                .map_err(|e| FramerError::BadJson(e.to_string()))?;
            records.push(value);
        }
        Ok(records)
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Everything the server ever sends down a session's socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "ev")]
pub enum ServerEvent {
    #[serde(rename = "WELCOME")]
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "serverVersion")]
        server_version: u64,
    },
    #[serde(rename = "DOC_SNAPSHOT")]
    DocSnapshot {
        #[serde(rename = "docId")]
        doc_id: String,
        version: u64,
        content: String,
    },
    #[serde(rename = "APPLIED")]
    Applied {
        #[serde(rename = "docId")]
        doc_id: String,
        version: u64,
        patch: Patch,
        by: String,
    },
    #[serde(rename = "BROADCAST")]
    Broadcast {
        #[serde(rename = "docId")]
        doc_id: String,
        version: u64,
        patch: Patch,
        by: String,
    },
    #[serde(rename = "ERROR")]
    Error {
        code: ErrorCode,
        #[serde(rename = "docId", skip_serializing_if = "Option::is_none")]
        doc_id: Option<String>,
        #[serde(rename = "serverVersion", skip_serializing_if = "Option::is_none")]
        server_version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    #[serde(rename = "PONG")]
    Pong {},
}

impl ServerEvent {
    pub fn error(code: ErrorCode, hint: Option<String>) -> Self {
        ServerEvent::Error { code, doc_id: None, server_version: None, hint }
    }

    pub fn out_of_date(doc_id: String, server_version: u64) -> Self {
        ServerEvent::Error {
            code: ErrorCode::OutOfDate,
            doc_id: Some(doc_id),
            server_version: Some(server_version),
            hint: None,
        }
    }

    /// Serializes as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}
