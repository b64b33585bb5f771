//! Rebuild `basement_entries` from soft-deleted books. Direct mode only.

use std::sync::Arc;

use clap::Parser;

use wordloom::bootstrap::cli_pool;
use wordloom::{RebuildArgs, Rebuilder};
use wordloom_core::ports::SystemClock;
use wordloom_postgres::{PgBasementStore, PgProjectionStatusStore, PgSourceReader};

#[derive(Debug, Parser)]
#[command(name = "rebuild_basement")]
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
    let index = PgBasementStore::new(pool.clone());

    let report = rebuilder
        .rebuild_basement(&index, args.rebuild.options())
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    pool.close().await;
    Ok(())
}
