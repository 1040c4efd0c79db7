use super::*;
use async_trait::async_trait;
use serde_json::json;

use crate::frame::ErrorCode;
use crate::state::test_helpers::{self, BOARD};

fn join_frame(id: &str, slug: &str, token: &str) -> ClientFrame {
    ClientFrame::new(CMD_JOIN, id, json!({ "board_slug_id": slug, "user_auth_token": token }))
}

fn cursor_frame(id: &str, x: f64, y: f64) -> ClientFrame {
    ClientFrame::new(CMD_CURSOR, id, json!({ "x": x, "y": y }))
}

/// Unwrap a single error reply into `(reply_to, code, error body)`.
fn single_error(effects: &[Effect]) -> (String, u64, Value) {
    let [Effect::Reply(frame)] = effects else {
        panic!("expected one reply, got {effects:?}");
    };
    let err = frame.data["error"].clone();
    let code = err["code"].as_u64().expect("error code");
    (frame.reply_to.clone().expect("reply_to"), code, err)
}

async fn joined_session() -> Session {
    let users = test_helpers::known_users();
    let mut session = Session::new(Uuid::new_v4());
    let effects = session
        .dispatch(&users, join_frame("j", BOARD, "token-alice"))
        .await;
    assert_eq!(effects, vec![Effect::Register { reply_to: "j".into() }]);
    session
}

// =============================================================================
// DECODE
// =============================================================================

#[test]
fn decode_unknown_command() {
    assert_eq!(Command::decode("paint", json!({})), Err(WsError::CmdNotFound));
}

#[test]
fn decode_join_validates_every_field() {
    let err = Command::decode(CMD_JOIN, json!({ "board_slug_id": "short", "user_auth_token": "abc" }))
        .expect_err("both fields invalid");
    let WsError::Fields(fields) = err else {
        panic!("expected field error, got {err:?}");
    };
    assert_eq!(fields["board_slug_id"], "must be 12 bytes long");
    assert_eq!(fields["user_auth_token"], "required");
}

#[test]
fn decode_join_missing_fields_are_validation_errors() {
    let err = Command::decode(CMD_JOIN, json!({})).expect_err("empty join");
    assert_eq!(err.error_code(), 1003);
}

#[test]
fn decode_join_token_boundary() {
    assert!(Command::decode(CMD_JOIN, json!({ "board_slug_id": BOARD, "user_auth_token": "12345" })).is_err());
    assert!(Command::decode(CMD_JOIN, json!({ "board_slug_id": BOARD, "user_auth_token": "123456" })).is_ok());
}

#[test]
fn decode_malformed_payload_is_unknown() {
    let err = Command::decode(CMD_CURSOR, json!({ "x": "left" })).expect_err("bad cursor");
    assert!(matches!(err, WsError::Unknown(_)));
    assert_eq!(err.error_code(), 1004);

    let err = Command::decode(CMD_JOIN, json!("not an object")).expect_err("bad join");
    assert!(matches!(err, WsError::Unknown(_)));
}

#[test]
fn decode_cursor_accepts_uppercase_y() {
    let cmd = Command::decode(CMD_CURSOR, json!({ "x": 1.0, "Y": 2.0 })).expect("cursor");
    assert_eq!(cmd, Command::Cursor(Cursor { x: 1.0, y: 2.0 }));
}

// =============================================================================
// DISPATCH GATES
// =============================================================================

#[tokio::test]
async fn empty_id_is_rejected_first() {
    let users = test_helpers::known_users();
    let mut session = Session::new(Uuid::new_v4());
    let effects = session.dispatch(&users, cursor_frame("", 1.0, 1.0)).await;
    let (reply_to, code, _) = single_error(&effects);
    assert_eq!(reply_to, "ERR_ID_MUST_SET");
    assert_eq!(code, 1001);
}

#[tokio::test]
async fn cursor_before_join_is_unauthorized() {
    let users = test_helpers::known_users();
    let mut session = Session::new(Uuid::new_v4());
    let effects = session.dispatch(&users, cursor_frame("c1", 1.0, 1.0)).await;
    let (reply_to, code, err) = single_error(&effects);
    assert_eq!(reply_to, "c1");
    assert_eq!(code, 1002);
    assert_eq!(err["message"], "not authorized");
    assert!(!session.is_joined());
    assert!(session.cursor_watch().borrow().is_none());
}

#[tokio::test]
async fn unknown_command_after_join_keeps_session() {
    let users = test_helpers::known_users();
    let mut session = joined_session().await;
    let effects = session
        .dispatch(&users, ClientFrame::new("paint", "p1", json!({})))
        .await;
    let (reply_to, code, _) = single_error(&effects);
    assert_eq!(reply_to, "p1");
    assert_eq!(code, 1000);
    assert!(session.is_joined());
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn join_binds_user_and_board() {
    let session = joined_session().await;
    let (user, board) = session.joined().expect("joined");
    assert_eq!(user.id, 1);
    assert_eq!(board, BOARD);
}

#[tokio::test]
async fn join_with_invalid_fields_reports_field_map() {
    let users = test_helpers::known_users();
    let mut session = Session::new(Uuid::new_v4());
    let effects = session
        .dispatch(&users, join_frame("j1", "nope", "token-alice"))
        .await;
    let (reply_to, code, err) = single_error(&effects);
    assert_eq!(reply_to, "j1");
    assert_eq!(code, 1003);
    assert_eq!(err["message"], "field error");
    assert_eq!(err["fields"]["board_slug_id"], "must be 12 bytes long");
    assert!(err["fields"].get("user_auth_token").is_none());
}

#[tokio::test]
async fn join_with_unknown_token_stays_unauthenticated() {
    let users = test_helpers::known_users();
    let mut session = Session::new(Uuid::new_v4());
    let effects = session
        .dispatch(&users, join_frame("j1", BOARD, "token-mallory"))
        .await;
    let (_, code, _) = single_error(&effects);
    assert_eq!(code, 1002);
    assert_eq!(session.state(), &SessionState::Unauthenticated);

    // A later valid join still works.
    let effects = session
        .dispatch(&users, join_frame("j2", BOARD, "token-bob"))
        .await;
    assert_eq!(effects, vec![Effect::Register { reply_to: "j2".into() }]);
}

struct DownUsers;

#[async_trait]
impl UserLookup for DownUsers {
    async fn resolve_token(&self, _scope: TokenScope, _token: &str) -> Result<User, LookupError> {
        Err(LookupError::Database(sqlx::Error::PoolTimedOut))
    }
}

#[tokio::test]
async fn join_with_lookup_outage_is_unauthorized() {
    let mut session = Session::new(Uuid::new_v4());
    let effects = session
        .dispatch(&DownUsers, join_frame("j1", BOARD, "token-alice"))
        .await;
    let (_, code, _) = single_error(&effects);
    assert_eq!(code, 1002);
    assert!(!session.is_joined());
}

struct SlowUsers;

#[async_trait]
impl UserLookup for SlowUsers {
    async fn resolve_token(&self, _scope: TokenScope, _token: &str) -> Result<User, LookupError> {
        Err(LookupError::Timeout(crate::services::users::LOOKUP_TIMEOUT))
    }
}

#[tokio::test]
async fn join_with_lookup_timeout_is_unauthorized() {
    let mut session = Session::new(Uuid::new_v4());
    let effects = session
        .dispatch(&SlowUsers, join_frame("j1", BOARD, "token-alice"))
        .await;
    let (reply_to, code, _) = single_error(&effects);
    assert_eq!(reply_to, "j1");
    assert_eq!(code, 1002);
    assert!(!session.is_joined());
}

#[tokio::test]
async fn second_join_is_refused() {
    let users = test_helpers::known_users();
    let mut session = joined_session().await;
    let effects = session
        .dispatch(&users, join_frame("j2", "BBBBBBBBBBBB", "token-bob"))
        .await;
    let (reply_to, code, _) = single_error(&effects);
    assert_eq!(reply_to, "j2");
    assert_eq!(code, 1008);

    let (user, board) = session.joined().expect("still joined");
    assert_eq!(user.id, 1);
    assert_eq!(board, BOARD);
}

// =============================================================================
// CURSOR
// =============================================================================

#[tokio::test]
async fn cursor_updates_watch_and_publishes_excluding_self() {
    let users = test_helpers::known_users();
    let mut session = joined_session().await;
    let watch = session.cursor_watch();
    assert_eq!(*watch.borrow(), None);

    let effects = session.dispatch(&users, cursor_frame("c1", 10.5, -3.0)).await;

    assert_eq!(*watch.borrow(), Some(Cursor { x: 10.5, y: -3.0 }));
    let [Effect::Publish { board_id, event, exclude_user }] = effects.as_slice() else {
        panic!("expected one publish, got {effects:?}");
    };
    assert_eq!(board_id, BOARD);
    assert_eq!(*exclude_user, Some(1));
    assert_eq!(event.event.as_deref(), Some(frame::EVENT_CURSOR));
    assert_eq!(event.data["cursor"]["x"], 10.5);
    assert_eq!(event.data["cursor"]["y"], -3.0);
    assert_eq!(event.data["cursor"]["user_id"], 1);
    assert_eq!(event.data["cursor"]["user_name"], "Alice");
}
