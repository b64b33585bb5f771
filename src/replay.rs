//! Operator replay of `failed` outbox rows.

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use wordloom_core::error::Result;
use wordloom_core::outbox::{Projection, ReplayAudit, ReplayFilter, ReplayOutcome};
use wordloom_core::ports::OutboxStore;

/// Move failed outbox rows back to pending.
#[derive(Debug, Clone, Parser)]
#[command(name = "replay_failed")]
pub struct ReplayArgs {
    /// Operator performing the replay.
    #[arg(long)]
    pub by: String,

    /// Why the rows are being replayed.
    #[arg(long)]
    pub reason: String,

    /// Outbox to replay from.
    #[arg(long, default_value = "search")]
    pub projection: Projection,

    #[arg(long)]
    pub entity_type: Option<String>,

    /// Only rows that failed within the last N hours.
    #[arg(long)]
    pub since_hours: Option<u32>,

    /// Only these row ids (comma separated or repeated).
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub ids: Vec<Uuid>,

    #[arg(long)]
    pub limit: Option<u32>,

    /// Count matching rows without changing them.
    #[arg(long)]
    pub dry_run: bool,
}

impl ReplayArgs {
    pub fn audit(&self) -> Result<ReplayAudit> {
        ReplayAudit::new(&self.by, &self.reason)
    }

    pub fn filter(&self) -> ReplayFilter {
        ReplayFilter {
            entity_type: self.entity_type.clone(),
            since_hours: self.since_hours,
            ids: self.ids.clone(),
            limit: self.limit,
        }
    }
}

pub async fn replay_failed(
    outbox: &dyn OutboxStore,
    filter: &ReplayFilter,
    audit: &ReplayAudit,
    dry_run: bool,
) -> Result<ReplayOutcome> {
    let outcome = outbox.replay_failed(filter, audit, dry_run).await?;
    info!(
        projection = outbox.projection().as_str(),
        by = %audit.by,
        reason = %audit.reason,
        matched = outcome.matched,
        replayed = outcome.replayed.len(),
        dry_run,
        "replay finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wordloom_core::outbox::{EnqueueRequest, OutboxStatus};
    use wordloom_harness::{InMemoryOutbox, ManualClock};

    use super::*;

    #[test]
    fn parses_full_command_line() {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        let args = ReplayArgs::try_parse_from([
            "replay_failed",
            "--by",
            "alice",
            "--reason",
            "fixed projector",
            "--projection",
            "chronicle",
            "--ids",
            &format!("{a},{b}"),
            "--limit",
            "10",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.projection, Projection::Chronicle);
        assert_eq!(args.filter().ids, vec![a, b]);
        assert_eq!(args.filter().limit, Some(10));
        assert!(args.dry_run);
        assert_eq!(args.audit().unwrap().by, "alice");
    }

    #[test]
    fn by_and_reason_are_mandatory() {
        assert!(ReplayArgs::try_parse_from(["replay_failed", "--by", "alice"]).is_err());
        let blank = ReplayArgs::try_parse_from(["replay_failed", "--by", " ", "--reason", "x"])
            .unwrap();
        assert!(blank.audit().is_err());
    }

    #[tokio::test]
    async fn dry_run_counts_without_touching_rows() {
        let clock = Arc::new(ManualClock::at_epoch());
        let outbox = InMemoryOutbox::new(Projection::Search, clock);
        let id = outbox.enqueue_now(EnqueueRequest::upsert("book", "b")).unwrap();
        outbox
            .claim_batch("w", 1, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        outbox
            .mark_failed(
                id,
                "w",
                &wordloom_core::outbox::RowFailure::new(
                    wordloom_core::ErrorReason::MalformedPayload,
                    "bad",
                ),
            )
            .await
            .unwrap();

        let audit = ReplayAudit::new("alice", "check").unwrap();
        let outcome = replay_failed(&outbox, &ReplayFilter::default(), &audit, true)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert!(outcome.replayed.is_empty());
        assert_eq!(outbox.row(id).unwrap().status, OutboxStatus::Failed);
    }
}
