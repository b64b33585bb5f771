//! Isolated test databases.
//!
//! Each call creates a fresh database, applies every migration under
//! `migrations/` in filename order and seeds the environment sentinel with
//! `test`. Drop it with [`drop_db`] when the test finishes.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use wordloom_postgres::PgSentinelStore;

pub struct IsolatedDb {
    pub pool: PgPool,
    pub dbname: String,
    admin: PgPool,
}

/// `admin_url` must allow CREATE/DROP DATABASE.
pub async fn isolated_db(admin_url: &str) -> anyhow::Result<IsolatedDb> {
    let dbname = format!("wordloom_test_{}", uuid::Uuid::new_v4().simple());

    let admin_opts = PgConnectOptions::from_str(admin_url).context("admin_url parse failed")?;
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_opts)
        .await
        .context("admin connect failed")?;

    sqlx::query(&format!(r#"CREATE DATABASE "{}""#, dbname))
        .execute(&admin)
        .await
        .context("CREATE DATABASE failed")?;

    let test_opts = PgConnectOptions::from_str(admin_url)?.database(&dbname);
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_opts)
        .await
        .context("test db connect failed")?;

    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    run_migrations(&pool, &migrations_dir).await?;
    PgSentinelStore::new(pool.clone()).set("test").await?;

    Ok(IsolatedDb {
        pool,
        dbname,
        admin,
    })
}

async fn run_migrations(pool: &PgPool, dir: &Path) -> anyhow::Result<()> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read migrations dir {}", dir.display()))?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            name.ends_with(".sql").then(|| (name, entry.path()))
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in &files {
        let sql = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read migration {name}"))?;
        sqlx::raw_sql(&sql)
            .execute(pool)
            .await
            .with_context(|| format!("migration {name} failed"))?;
    }
    Ok(())
}

/// Drop the database; safe to call after a failed test.
pub async fn drop_db(iso: IsolatedDb) {
    iso.pool.close().await;
    let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, iso.dbname);
    let _ = sqlx::query(&drop_sql).execute(&iso.admin).await;
    iso.admin.close().await;
}
