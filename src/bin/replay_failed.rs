//! Move `failed` outbox rows back to `pending`.
//!
//! ```text
//! replay_failed --by alice --reason "projector fixed" --projection search \
//!     --entity-type block --since-hours 24 --limit 100 [--dry-run]
//! ```

use anyhow::Context;
use clap::Parser;

use wordloom::bootstrap::cli_pool;
use wordloom::{replay_failed, ReplayArgs};
use wordloom_postgres::PgOutboxStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ReplayArgs::parse();
    let audit = args.audit()?;
    let pool = cli_pool().await?;
    let outbox = PgOutboxStore::new(pool.clone(), args.projection)?;

    let outcome = replay_failed(&outbox, &args.filter(), &audit, args.dry_run)
        .await
        .context("replay failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    pool.close().await;
    Ok(())
}
