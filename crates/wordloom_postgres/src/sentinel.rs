use async_trait::async_trait;
use sqlx::PgPool;

use wordloom_core::error::Result;
use wordloom_core::ports::SentinelStore;

use crate::error::db_err;

/// `environment_sentinel` reader.
pub struct PgSentinelStore {
    pool: PgPool,
}

impl PgSentinelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Seed the sentinel row; used by test databases and first-time setup.
    pub async fn set(&self, env: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environment_sentinel (id, env) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET env = EXCLUDED.env
            "#,
        )
        .bind(env)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SentinelStore for PgSentinelStore {
    async fn environment(&self) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT env FROM environment_sentinel WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}
