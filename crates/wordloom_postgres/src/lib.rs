//! PostgreSQL implementations of the `wordloom_core` ports.
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so the crate
//! builds without a live database.

pub mod bus;
pub mod chronicle;
pub mod error;
pub mod handlers;
pub mod outbox;
pub mod read_models;
pub mod repository;
pub mod sentinel;
pub mod source;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use bus::{DispatchReport, EventBus, EventHandler, HandlerRegistry, TxMode};
pub use error::db_err;
pub use chronicle::{record_chronicle, CHRONICLE_ENTITY_TYPE};
pub use handlers::BasementProjectionHandler;
pub use outbox::{enqueue_outbox, OutboxBatch, PgOutboxStore};
pub use read_models::{
    PgBasementStore, PgChronicleStore, PgProjectionStatusStore, PgSearchIndexStore,
};
pub use repository::{PgBlockRepository, PgBookRepository};
pub use sentinel::PgSentinelStore;
pub use source::PgSourceReader;

/// Pool with the defaults every binary uses.
pub async fn connect(database_url: &str, max_connections: u32) -> wordloom_core::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(db_err)
}

/// Registry with the built-in handlers.
pub fn default_handlers() -> HandlerRegistry {
    use std::sync::Arc;
    HandlerRegistry::new().register(Arc::new(BasementProjectionHandler))
}
