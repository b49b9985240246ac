//! Pure functions for validating and applying edit operations against
//! document content. Positions and lengths are counted in Unicode scalar
//! values (`char`s), not bytes or UTF-16 code units, so multi-byte text
//! never splits a codepoint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A structured description of one accepted edit, in canonical wire form.
///
/// This is both the payload embedded in `APPLIED`/`BROADCAST` events and
/// the record persisted in the oplog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Patch {
    #[serde(rename = "INSERT")]
    Insert { pos: usize, text: String },
    #[serde(rename = "DELETE")]
    Delete { pos: usize, len: usize },
    #[serde(rename = "REPLACE")]
    Replace { pos: usize, len: usize, text: String },
}

/// Validation/application failure codes, shared with the wire `ERROR` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidOp,
    UnknownOp,
    InvalidDoc,
    InvalidRange,
    InvalidPayload,
    NotReady,
    OutOfDate,
    BadJson,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidOp => "INVALID_OP",
            ErrorCode::UnknownOp => "UNKNOWN_OP",
            ErrorCode::InvalidDoc => "INVALID_DOC",
            ErrorCode::InvalidRange => "INVALID_RANGE",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::NotReady => "NOT_READY",
            ErrorCode::OutOfDate => "OUT_OF_DATE",
            ErrorCode::BadJson => "BAD_JSON",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates `message` against `content` and, on success, returns the new
/// content together with the patch descriptor that produced it. Does not
/// mutate any shared state; callers are responsible for committing the
/// result under the document's lock.
pub fn apply_operation(content: &str, message: &Map<String, Value>) -> Result<(String, Patch), ErrorCode> {
    let op = message
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_uppercase();

    let len = char_len(content);

    match op.as_str() {
        "INSERT" => {
            let pos = coerce_pos(message.get("pos"), len)?;
            let text = coerce_text(message.get("text"))?;
            let new_content = splice(content, pos, pos, &text);
            Ok((new_content, Patch::Insert { pos, text }))
        }
        "DELETE" => {
            let pos = coerce_pos(message.get("pos"), len)?;
            let del_len = coerce_len(message.get("len"))?;
            if pos + del_len > len {
                return Err(ErrorCode::InvalidRange);
            }
            let new_content = splice(content, pos, pos + del_len, "");
            Ok((new_content, Patch::Delete { pos, len: del_len }))
        }
        "REPLACE" => {
            let pos = coerce_pos(message.get("pos"), len)?;
            let rep_len = coerce_len(message.get("len"))?;
            let text = coerce_text(message.get("text"))?;
            if pos + rep_len > len {
                return Err(ErrorCode::InvalidRange);
            }
            let new_content = splice(content, pos, pos + rep_len, &text);
            Ok((new_content, Patch::Replace { pos, len: rep_len, text }))
        }
        _ => Err(ErrorCode::InvalidOp),
    }
}

/// Re-applies an already-validated patch (from the oplog) against `content`.
/// Used by persistence replay; shares the same range checks as
/// [`apply_operation`] so replay and live application can never diverge.
pub fn apply_patch(content: &str, patch: &Patch) -> Result<String, ErrorCode> {
    let len = char_len(content);
    match patch {
        Patch::Insert { pos, text } => {
            if *pos > len {
                return Err(ErrorCode::InvalidRange);
            }
            Ok(splice(content, *pos, *pos, text))
        }
        Patch::Delete { pos, len: del_len } => {
            if *pos > len || pos + del_len > len {
                return Err(ErrorCode::InvalidRange);
            }
            Ok(splice(content, *pos, pos + del_len, ""))
        }
        Patch::Replace { pos, len: rep_len, text } => {
            if *pos > len || pos + rep_len > len {
                return Err(ErrorCode::InvalidRange);
            }
            Ok(splice(content, *pos, pos + rep_len, text))
        }
    }
}

fn coerce_pos(value: Option<&Value>, content_len: usize) -> Result<usize, ErrorCode> {
    let pos = match value {
        None => 0,
        Some(v) => coerce_int(v).ok_or(ErrorCode::InvalidRange)?,
    };
    if pos < 0 || pos as usize > content_len {
        return Err(ErrorCode::InvalidRange);
    }
    Ok(pos as usize)
}

fn coerce_len(value: Option<&Value>) -> Result<usize, ErrorCode> {
    let value = value.ok_or(ErrorCode::InvalidRange)?;
    let n = coerce_int(value).ok_or(ErrorCode::InvalidRange)?;
    if n < 0 {
        return Err(ErrorCode::InvalidRange);
    }
    Ok(n as usize)
}

fn coerce_text(value: Option<&Value>) -> Result<String, ErrorCode> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        None => Ok(String::new()),
        Some(_) => Err(ErrorCode::InvalidPayload),
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `idx`-th character boundary in `s` (`idx == char_len(s)`
/// yields `s.len()`). Callers must have already range-checked `idx`.
fn char_byte_offset(s: &str, idx: usize) -> usize {
    if idx == 0 {
        return 0;
    }
    s.char_indices().nth(idx).map(|(b, _)| b).unwrap_or(s.len())
}

fn splice(content: &str, start_char: usize, end_char: usize, insert: &str) -> String {
    let start = char_byte_offset(content, start_char);
    let end = char_byte_offset(content, end_char);
    let mut out = String::with_capacity(content.len() - (end - start) + insert.len());
    out.push_str(&content[..start]);
    out.push_str(insert);
    out.push_str(&content[end..]);
    out
}
