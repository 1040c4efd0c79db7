//! Command handling for one connection.
//!
//! DESIGN
//! ======
//! Inbound frames are decoded into a closed [`Command`] enum and applied to a
//! [`Session`]. Handlers are pure business logic: they validate, move the
//! session through its state machine, and return [`Effect`]s. The websocket
//! layer owns every outbound concern (replies, hub registration, publishes),
//! so this module can be tested without a socket.
//!
//! STATE MACHINE
//! =============
//! `Unauthenticated → Joined`. `Joined` is terminal until disconnect; a second
//! join is refused with `AlreadyJoined`.

use std::collections::BTreeMap;

use frames::{ClientFrame, ServerFrame};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::users::{LookupError, TokenScope, UserLookup};
use crate::frame::{self, CMD_CURSOR, CMD_JOIN, WsError};
use crate::state::{BOARD_SLUG_LEN, BoardId, Cursor, User, UserId};

const MIN_TOKEN_LEN: usize = 6;

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub board_slug_id: String,
    #[serde(default)]
    pub user_auth_token: String,
}

impl JoinRequest {
    /// Field → message map of every violated constraint.
    fn violations(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if self.board_slug_id.len() != BOARD_SLUG_LEN {
            fields.insert("board_slug_id".into(), "must be 12 bytes long".into());
        }
        if self.user_auth_token.len() < MIN_TOKEN_LEN {
            fields.insert("user_auth_token".into(), "required".into());
        }
        fields
    }
}

/// Every command a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Join(JoinRequest),
    Cursor(Cursor),
}

impl Command {
    /// Decode a payload by command name and validate it.
    ///
    /// # Errors
    ///
    /// `CmdNotFound` for unknown names, `Unknown` when the payload does not
    /// decode, `Fields` when a join payload fails validation.
    pub fn decode(kind: &str, data: Value) -> Result<Self, WsError> {
        match kind {
            CMD_JOIN => {
                let req: JoinRequest = serde_json::from_value(data).map_err(|e| WsError::Unknown(e.to_string()))?;
                let fields = req.violations();
                if fields.is_empty() {
                    Ok(Self::Join(req))
                } else {
                    Err(WsError::Fields(fields))
                }
            }
            CMD_CURSOR => serde_json::from_value(data)
                .map(Self::Cursor)
                .map_err(|e| WsError::Unknown(e.to_string())),
            _ => Err(WsError::CmdNotFound),
        }
    }
}

// =============================================================================
// EFFECTS
// =============================================================================

/// What the websocket layer must do after a command was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send this frame to the originating client only.
    Reply(ServerFrame),
    /// Publish an event on a board, skipping every connection of `exclude_user`.
    Publish { board_id: BoardId, event: ServerFrame, exclude_user: Option<UserId> },
    /// Join completed: stop the join watchdog and register with the hub; the
    /// hub answers `reply_to` with the roster.
    Register { reply_to: String },
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Joined { user: User, board_id: BoardId },
}

/// Per-connection command state.
pub struct Session {
    client_id: Uuid,
    state: SessionState,
    cursor: watch::Sender<Option<Cursor>>,
}

impl Session {
    #[must_use]
    pub fn new(client_id: Uuid) -> Self {
        let (cursor, _) = watch::channel(None);
        Self { client_id, state: SessionState::Unauthenticated, cursor }
    }

    #[cfg(test)]
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined { .. })
    }

    /// The bound user and board once joined.
    #[must_use]
    pub fn joined(&self) -> Option<(&User, &str)> {
        match &self.state {
            SessionState::Joined { user, board_id } => Some((user, board_id.as_str())),
            SessionState::Unauthenticated => None,
        }
    }

    /// Read side of this connection's cursor, handed to the hub on register.
    #[must_use]
    pub fn cursor_watch(&self) -> watch::Receiver<Option<Cursor>> {
        self.cursor.subscribe()
    }

    /// Run one decoded client frame through the gates and the handlers.
    ///
    /// Gate order: empty id, then join-required, then decode.
    pub async fn dispatch(&mut self, users: &dyn UserLookup, frame: ClientFrame) -> Vec<Effect> {
        if frame.id.is_empty() {
            return vec![reply_error(&WsError::IdMustSet, "")];
        }
        if frame.kind != CMD_JOIN && !self.is_joined() {
            debug!(client_id = %self.client_id, kind = %frame.kind, "ws: command before join");
            return vec![reply_error(&WsError::Auth, &frame.id)];
        }

        match Command::decode(&frame.kind, frame.data) {
            Ok(cmd) => self.handle(users, &frame.id, cmd).await,
            Err(e) => {
                debug!(client_id = %self.client_id, kind = %frame.kind, error = %e, "ws: rejected command");
                vec![reply_error(&e, &frame.id)]
            }
        }
    }

    /// Apply a decoded command.
    pub async fn handle(&mut self, users: &dyn UserLookup, id: &str, cmd: Command) -> Vec<Effect> {
        let result = match cmd {
            Command::Join(req) => self.handle_join(users, id, req).await,
            Command::Cursor(cursor) => self.handle_cursor(cursor),
        };
        result.unwrap_or_else(|e| vec![reply_error(&e, id)])
    }

    async fn handle_join(&mut self, users: &dyn UserLookup, id: &str, req: JoinRequest) -> Result<Vec<Effect>, WsError> {
        if self.is_joined() {
            return Err(WsError::AlreadyJoined);
        }

        let user = match users
            .resolve_token(TokenScope::Authentication, &req.user_auth_token)
            .await
        {
            Ok(user) => user,
            Err(LookupError::NotFound) => return Err(WsError::Auth),
            Err(e @ (LookupError::Database(_) | LookupError::Timeout(_))) => {
                error!(client_id = %self.client_id, error = %e, "ws: token lookup failed");
                return Err(WsError::Auth);
            }
        };

        info!(client_id = %self.client_id, user_id = user.id, board_id = %req.board_slug_id, "ws: joined");
        self.state = SessionState::Joined { user, board_id: req.board_slug_id };
        Ok(vec![Effect::Register { reply_to: id.to_owned() }])
    }

    fn handle_cursor(&self, cursor: Cursor) -> Result<Vec<Effect>, WsError> {
        let SessionState::Joined { user, board_id } = &self.state else {
            return Err(WsError::Auth);
        };
        self.cursor.send_replace(Some(cursor));

        Ok(vec![Effect::Publish {
            board_id: board_id.clone(),
            event: frame::cursor_moved(user, cursor),
            exclude_user: Some(user.id),
        }])
    }
}

fn reply_error(err: &WsError, reply_to: &str) -> Effect {
    Effect::Reply(err.to_frame(reply_to))
}

#[cfg(test)]
#[path = "command_test.rs"]
mod tests;
