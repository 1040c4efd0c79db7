//! Frame vocabulary for the board hub: command names, event names, the
//! protocol error taxonomy, and builders for every server → client frame.
//!
//! DESIGN
//! ======
//! The byte-level codec lives in the `frames` crate. This module decides
//! *what* goes inside a frame: handlers and the hub never assemble JSON by
//! hand, they call the builders here so the wire shapes stay in one place.
//!
//! ERROR FRAMES
//! ============
//! Every recoverable failure becomes `{"reply_to": id, "data": {"error":
//! {"code", "message", "fields"?}}}`. Failures detected before a correlation
//! id is known reply to a fixed `ERR_*` id instead.

use std::collections::BTreeMap;

use frames::{CodecError, ServerFrame};
use serde::Serialize;
use serde_json::{Value, json};

use crate::state::{Cursor, User};

// =============================================================================
// NAMES
// =============================================================================

pub const CMD_JOIN: &str = "join";
pub const CMD_CURSOR: &str = "cursor";

pub const EVENT_USER_JOINED: &str = "USER_JOINED";
pub const EVENT_USER_LEFT: &str = "USER_LEFT";
pub const EVENT_CURSOR: &str = "CURSOR";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Numeric wire code for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> u16;
}

/// Everything a connection can be told went wrong without being dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WsError {
    #[error("command not found")]
    CmdNotFound,
    #[error("id must set")]
    IdMustSet,
    #[error("not authorized")]
    Auth,
    #[error("field error")]
    Fields(BTreeMap<String, String>),
    #[error("{0}")]
    Unknown(String),
    #[error("only binary messages are allowed")]
    UnknownMessageType,
    #[error("unknown compression method")]
    UnknownCompressionMethod,
    #[error("{0}")]
    JsonDecoding(String),
    #[error("already joined a board")]
    AlreadyJoined,
}

impl ErrorCode for WsError {
    fn error_code(&self) -> u16 {
        match self {
            Self::CmdNotFound => 1000,
            Self::IdMustSet => 1001,
            Self::Auth => 1002,
            Self::Fields(_) => 1003,
            Self::Unknown(_) => 1004,
            Self::UnknownMessageType => 1005,
            Self::UnknownCompressionMethod => 1006,
            Self::JsonDecoding(_) => 1007,
            Self::AlreadyJoined => 1008,
        }
    }
}

impl WsError {
    /// Reply id used when the failing frame has no usable correlation id.
    #[must_use]
    pub fn fallback_reply_to(&self) -> Option<&'static str> {
        match self {
            Self::UnknownMessageType => Some("ERR_UNKNOWN_MESSAGE_TYPE"),
            Self::UnknownCompressionMethod => Some("ERR_UNKNOWN_COMPRESSION_METHOD"),
            Self::JsonDecoding(_) => Some("ERR_JSON_DECODE"),
            Self::IdMustSet => Some("ERR_ID_MUST_SET"),
            _ => None,
        }
    }

    /// Error frame answering `reply_to`, or the fallback id when one applies.
    #[must_use]
    pub fn to_frame(&self, reply_to: &str) -> ServerFrame {
        let reply_to = self.fallback_reply_to().unwrap_or(reply_to);
        let mut error = json!({ "code": self.error_code(), "message": self.to_string() });
        if let Self::Fields(fields) = self {
            error["fields"] = json!(fields);
        }
        ServerFrame::reply(reply_to, ServerFrame::single("error", error))
    }
}

impl From<CodecError> for WsError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Compression(_) => Self::UnknownCompressionMethod,
            CodecError::TooLarge | CodecError::Json(_) => Self::JsonDecoding(err.to_string()),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// One line of the join roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub user: User,
    pub cursor: Option<Cursor>,
}

#[derive(Serialize)]
struct CursorWithUser<'a> {
    x: f64,
    y: f64,
    user_id: i64,
    user_name: &'a str,
}

#[must_use]
pub fn user_joined(user: &User) -> ServerFrame {
    ServerFrame::event(EVENT_USER_JOINED, ServerFrame::single("user", json!(user)))
}

#[must_use]
pub fn user_left(user: &User) -> ServerFrame {
    ServerFrame::event(EVENT_USER_LEFT, ServerFrame::single("user", json!(user)))
}

#[must_use]
pub fn cursor_moved(user: &User, cursor: Cursor) -> ServerFrame {
    let payload = CursorWithUser { x: cursor.x, y: cursor.y, user_id: user.id, user_name: &user.full_name };
    ServerFrame::event(EVENT_CURSOR, ServerFrame::single("cursor", json!(payload)))
}

/// Reply to a successful join: the other users already on the board.
#[must_use]
pub fn join_roster(reply_to: &str, online_users: &[RosterEntry]) -> ServerFrame {
    let data: Value = json!({ "join": { "online_users": online_users } });
    ServerFrame::reply(reply_to, data)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
