//! Shared application state and the small domain types every layer uses.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the hub handle (the only way to touch board membership), the token
//! lookup used by `join`, and the per-connection limits. Live membership is
//! *not* here: it belongs to the hub actor alone.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConnectionLimits;
use crate::services::hub::HubHandle;
use crate::services::users::UserLookup;

/// Board identifier: an opaque 12-byte slug.
pub type BoardId = String;

/// Identity used for roster deduplication and self-exclusion.
pub type UserId = i64;

pub const BOARD_SLUG_LEN: usize = 12;

// =============================================================================
// USER
// =============================================================================

/// Authenticated user as resolved from an auth token. Serialized verbatim
/// into presence events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub auth_provider: String,
    pub is_verified: bool,
    pub version: i32,
}

// =============================================================================
// CURSOR
// =============================================================================

/// Last-known pointer position of one connection on its board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    #[serde(alias = "Y")]
    pub y: f64,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub users: Arc<dyn UserLookup>,
    pub limits: ConnectionLimits,
}

impl AppState {
    #[must_use]
    pub fn new(hub: HubHandle, users: Arc<dyn UserLookup>, limits: ConnectionLimits) -> Self {
        Self { hub, users, limits }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::services::backplane::MemoryBackplane;
    use crate::services::hub;
    use crate::services::users::StaticUsers;

    pub const BOARD: &str = "AAAAAAAAAAAA";

    #[must_use]
    pub fn user(id: UserId, name: &str) -> User {
        User {
            id,
            full_name: name.into(),
            email: format!("{}@example.test", name.to_lowercase()),
            auth_provider: "email".into(),
            is_verified: true,
            version: 1,
        }
    }

    /// Lookup knowing `token-alice` (id 1) and `token-bob` (id 2).
    #[must_use]
    pub fn known_users() -> StaticUsers {
        StaticUsers::new([("token-alice", user(1, "Alice")), ("token-bob", user(2, "Bob"))])
    }

    /// State wired to an in-memory backplane, plus that backplane for inspection.
    #[must_use]
    pub fn test_app_state(limits: ConnectionLimits) -> (AppState, Arc<MemoryBackplane>) {
        let backplane = Arc::new(MemoryBackplane::new());
        let hub = hub::spawn(backplane.clone());
        (AppState::new(hub, Arc::new(known_users()), limits), backplane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_accepts_either_y_casing() {
        let lower: Cursor = serde_json::from_str(r#"{"x": 1.5, "y": 2.5}"#).unwrap();
        let upper: Cursor = serde_json::from_str(r#"{"x": 1.5, "Y": 2.5}"#).unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn cursor_serializes_lowercase_y() {
        let json = serde_json::to_string(&Cursor { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(json, r#"{"x":1.0,"y":2.0}"#);
    }

    #[test]
    fn user_serde_round_trip() {
        let user = test_helpers::user(7, "Grace");
        let json = serde_json::to_string(&user).unwrap();
        let restored: User = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, user);
        assert!(json.contains(r#""full_name":"Grace""#));
    }
}
