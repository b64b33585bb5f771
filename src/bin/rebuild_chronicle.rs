//! Rebuild `chronicle_entries` from `chronicle_events`.

use std::sync::Arc;

use clap::Parser;

use wordloom::bootstrap::cli_pool;
use wordloom::{RebuildArgs, Rebuilder};
use wordloom_core::ports::{OutboxStore, SystemClock};
use wordloom_core::Projection;
use wordloom_postgres::{PgChronicleStore, PgOutboxStore, PgProjectionStatusStore, PgSourceReader};

#[derive(Debug, Parser)]
#[command(name = "rebuild_chronicle")]
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
    let index = PgChronicleStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone(), Projection::Chronicle)?;

    let report = rebuilder
        .rebuild_chronicle(&index, Some(&outbox as &dyn OutboxStore), args.rebuild.options())
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    pool.close().await;
    Ok(())
}
