//! Wire envelopes exchanged with the terminal backend.
//!
//! Every frame carries exactly one JSON object:
//! `{ "type": "terminal_output", "session_id": "…", "data": "…" }`.
//! The codec is a pure transform; it never touches a socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version announced during the transport handshake. The envelope itself is
/// unversioned; breaking changes bump this number instead of accepting
/// alternative field spellings.
pub const PROTOCOL_VERSION: u32 = 1;

const KNOWN_TYPES: &[&str] = &[
    "terminal_input",
    "terminal_output",
    "terminal_control",
    "terminal_resize",
    "session_create",
    "session_close",
    "error",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Message {
    TerminalInput {
        session_id: String,
        data: String,
    },
    TerminalOutput {
        session_id: String,
        data: String,
    },
    TerminalControl {
        session_id: String,
        data: String,
    },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Sent by the client to open a session; echoed by the backend as the ack.
    /// `data` carries the JSON-encoded session target when a profile is used.
    SessionCreate {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    SessionClose {
        session_id: String,
    },
    /// Backend-side failure. An empty `session_id` means connection scope.
    Error {
        session_id: String,
        data: String,
    },
}

impl Message {
    pub fn session_id(&self) -> &str {
        match self {
            Message::TerminalInput { session_id, .. }
            | Message::TerminalOutput { session_id, .. }
            | Message::TerminalControl { session_id, .. }
            | Message::TerminalResize { session_id, .. }
            | Message::SessionCreate { session_id, .. }
            | Message::SessionClose { session_id }
            | Message::Error { session_id, .. } => session_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::TerminalInput { .. } => "terminal_input",
            Message::TerminalOutput { .. } => "terminal_output",
            Message::TerminalControl { .. } => "terminal_control",
            Message::TerminalResize { .. } => "terminal_resize",
            Message::SessionCreate { .. } => "session_create",
            Message::SessionClose { .. } => "session_close",
            Message::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("frame has no `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Serialize a message into one frame.
pub fn encode(message: &Message) -> Vec<u8> {
    // A derived Serialize over strings and integers cannot fail.
    serde_json::to_vec(message).unwrap_or_default()
}

/// Parse one frame. Unknown types are reported, never silently skipped.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| DecodeError::NotAnObject(e.to_string()))?;
    let kind = match value.as_object() {
        Some(object) => match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) | None => return Err(DecodeError::MissingType),
        },
        None => return Err(DecodeError::NotAnObject(value.to_string())),
    };
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        kind,
        reason: e.to_string(),
    })
}
