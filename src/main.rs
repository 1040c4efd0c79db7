mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, HubConfig};
use crate::services::backplane::{BackplaneError, MemoryBackplane, SharedBackplane};
use crate::services::nats::NatsBackplane;
use crate::services::users::PgUserLookup;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Backplane(#[from] BackplaneError),
    #[error("server failed: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "collabhub failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = HubConfig::from_env()?;

    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    let users = Arc::new(PgUserLookup::new(pool));

    let backplane: SharedBackplane = match config.nats_url.as_deref() {
        Some(url) => Arc::new(NatsBackplane::connect(url).await?),
        None => {
            tracing::warn!("NATS_SERVER_URL not set, events stay inside this instance");
            Arc::new(MemoryBackplane::new())
        }
    };

    let hub = services::hub::spawn(backplane);
    let state = state::AppState::new(hub.clone(), users, config.limits);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tracing::info!(port = config.port, "collabhub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(snapshot) = hub.snapshot().await {
        tracing::info!(boards = snapshot.boards.len(), topics = snapshot.topics.len(), "collabhub stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
