//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own membership, command semantics, pub/sub, and token
//! lookup so the route can stay focused on socket plumbing.

pub mod backplane;
pub mod command;
pub mod hub;
pub mod nats;
pub mod users;
