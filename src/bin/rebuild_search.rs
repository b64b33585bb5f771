//! Rebuild `search_index` from the source tables.
//!
//! `--direct` (default) upserts documents straight into the index using the
//! source `updated_at` as version; `--emit-outbox` enqueues an upsert per
//! source row for the outbox worker instead.

use std::sync::Arc;

use clap::Parser;

use wordloom::bootstrap::cli_pool;
use wordloom::{RebuildArgs, Rebuilder};
use wordloom_core::ports::{OutboxStore, SystemClock};
use wordloom_core::Projection;
use wordloom_postgres::{PgOutboxStore, PgProjectionStatusStore, PgSearchIndexStore, PgSourceReader};

#[derive(Debug, Parser)]
#[command(name = "rebuild_search")]
struct Cli {
    #[command(flatten)]
    rebuild: RebuildArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let pool = cli_pool().await?;
    let rebuilder = Rebuilder::new(
        Arc::new(PgSourceReader::new(pool.clone())),
        Arc::new(PgProjectionStatusStore::new(pool.clone())),
        Arc::new(SystemClock),
    );
    let index = PgSearchIndexStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone(), Projection::Search)?;

    let report = rebuilder
        .rebuild_search(&index, Some(&outbox as &dyn OutboxStore), args.rebuild.options())
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    pool.close().await;
    Ok(())
}
