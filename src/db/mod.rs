//! Database pool initialization.
//!
//! The hub only reads `users` and `tokens`; the schema and its migrations
//! belong to the REST service that writes them.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Initialize the PostgreSQL connection pool.
///
/// # Errors
///
/// Returns an error if the database is unreachable.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
