//! Startup shared by every binary: `.env`, logging, pool, sentinel check.

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use wordloom_core::ports::verify_environment;
use wordloom_postgres::{default_handlers, EventBus, PgSentinelStore};

use crate::config::bus_tx_mode;
use crate::telemetry::{init_logging, LogFormat};

/// Load `.env` if present. Call before reading any configuration.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
}

/// Connect and refuse to run unless the database sentinel names `env`.
pub async fn connect_checked(database_url: &str, env: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = wordloom_postgres::connect(database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    verify_environment(&PgSentinelStore::new(pool.clone()), env)
        .await
        .context("environment sentinel check failed")?;
    info!(env, "environment sentinel verified");
    Ok(pool)
}

/// Environment for the ops CLIs: pretty logs by default, `WORDLOOM_ENV` and
/// `DATABASE_URL` required.
pub async fn cli_pool() -> anyhow::Result<PgPool> {
    load_dotenv();
    init_logging(LogFormat::from_env_or(LogFormat::Pretty));
    let env = std::env::var("WORDLOOM_ENV").context("WORDLOOM_ENV must be set")?;
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    connect_checked(&url, &env, 4).await
}

/// Bus with both built-in handlers in the mode named by
/// `WORDLOOM_EVENT_BUS_TX_MODE`.
pub fn event_bus(pool: PgPool) -> anyhow::Result<EventBus> {
    let mode = bus_tx_mode(&|key| std::env::var(key).ok())?;
    Ok(EventBus::bootstrap(pool, default_handlers(), mode))
}
