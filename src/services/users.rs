//! Token → user resolution.
//!
//! ARCHITECTURE
//! ============
//! Users and their tokens are owned by the REST service; the hub only reads
//! them. Tokens are stored as the SHA-256 of the plaintext together with a
//! scope and an expiry, so a lookup hashes the presented token and matches
//! on `(hash, scope, expiry > now())`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use crate::state::User;

/// What a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    /// Issued for account activation. The hub never accepts it.
    #[cfg(test)]
    Activation,
    Authentication,
}

impl TokenScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            #[cfg(test)]
            Self::Activation => "activation",
            Self::Authentication => "authentication",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("no user for token")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("token lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Upper bound on one token lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Run a query under `deadline`, mapping expiry to [`LookupError::Timeout`].
async fn within<T>(
    deadline: Duration,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, LookupError> {
    match tokio::time::timeout(deadline, query).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(LookupError::Timeout(deadline)),
    }
}

/// Resolve a token of a given scope to its user. Enables fakes in tests.
#[async_trait]
pub trait UserLookup: Send + Sync {
    /// # Errors
    ///
    /// [`LookupError::NotFound`] for unknown, expired, or wrong-scope tokens.
    async fn resolve_token(&self, scope: TokenScope, token: &str) -> Result<User, LookupError>;
}

/// SHA-256 of the plaintext token, as stored in `tokens.hash`.
#[must_use]
pub fn token_hash(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgUserLookup {
    pool: PgPool,
}

impl PgUserLookup {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserLookup for PgUserLookup {
    async fn resolve_token(&self, scope: TokenScope, token: &str) -> Result<User, LookupError> {
        let query = sqlx::query(
            r"SELECT users.id::bigint AS id, users.full_name, users.email,
                     users.auth_provider, users.is_verified, users.version
              FROM users
              INNER JOIN tokens ON users.id = tokens.user_id
              WHERE tokens.hash = $1 AND tokens.scope = $2 AND tokens.expiry > now()",
        )
        .bind(token_hash(token))
        .bind(scope.as_str())
        .fetch_optional(&self.pool);
        let row = within(LOOKUP_TIMEOUT, query).await?;

        let Some(r) = row else {
            return Err(LookupError::NotFound);
        };

        Ok(User {
            id: r.get("id"),
            full_name: r.get("full_name"),
            email: r.get("email"),
            auth_provider: r.get("auth_provider"),
            is_verified: r.get::<Option<bool>, _>("is_verified").unwrap_or(false),
            version: r.get("version"),
        })
    }
}

// =============================================================================
// FAKE
// =============================================================================

/// Fixed token table, authentication scope only.
#[cfg(test)]
pub struct StaticUsers {
    by_token: std::collections::HashMap<String, User>,
}

#[cfg(test)]
impl StaticUsers {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, User)>) -> Self {
        Self { by_token: entries.into_iter().map(|(t, u)| (t.to_owned(), u)).collect() }
    }
}

#[cfg(test)]
#[async_trait]
impl UserLookup for StaticUsers {
    async fn resolve_token(&self, scope: TokenScope, token: &str) -> Result<User, LookupError> {
        if scope != TokenScope::Authentication {
            return Err(LookupError::NotFound);
        }
        self.by_token.get(token).cloned().ok_or(LookupError::NotFound)
    }
}

#[cfg(test)]
#[path = "users_test.rs"]
mod tests;
