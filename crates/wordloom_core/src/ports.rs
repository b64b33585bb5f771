//! Storage and downstream ports.
//!
//! Every method is async and object-safe so callers hold `Arc<dyn Port>`.
//! PostgreSQL adapters live in `wordloom_postgres`; in-memory adapters in
//! `wordloom_harness`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ProjectionError, Result};
use crate::outbox::{
    BacklogStats, EnqueueRequest, OutboxRow, Projection, ReplayAudit, ReplayFilter, ReplayOutcome,
    RowFailure,
};
use crate::read_model::{
    BasementEntry, ChronicleEntry, ProjectionStatus, SearchDocument, WriteOutcome,
};
use crate::source::{BookSnapshot, ChronicleSourceEvent, SearchEntityKind, SearchSource};

// ── Clock ─────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ── Outbox ────────────────────────────────────────────────────

/// One outbox table. State transitions return `false` when the
/// `owner = $worker AND status = 'processing'` guard did not match.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    fn projection(&self) -> Projection;

    /// Insert a `pending` row; re-enqueueing an existing id is a no-op.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid>;

    /// Return expired `processing` leases to `pending`. Returns rows reaped.
    async fn reap_expired_leases(&self) -> Result<u64>;

    /// Claim up to `limit` visible rows, lowest `event_version` first.
    async fn claim_batch(
        &self,
        owner: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxRow>>;

    async fn mark_done(&self, id: Uuid, owner: &str) -> Result<bool>;

    async fn schedule_retry(
        &self,
        id: Uuid,
        owner: &str,
        delay: Duration,
        failure: &RowFailure,
    ) -> Result<bool>;

    async fn mark_failed(&self, id: Uuid, owner: &str, failure: &RowFailure) -> Result<bool>;

    /// Backlog figures; rows `processing` longer than `stuck_after` count as stuck.
    async fn backlog(&self, stuck_after: Duration) -> Result<BacklogStats>;

    async fn replay_failed(
        &self,
        filter: &ReplayFilter,
        audit: &ReplayAudit,
        dry_run: bool,
    ) -> Result<ReplayOutcome>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRow>>;
}

// ── Read models ───────────────────────────────────────────────

#[async_trait]
pub trait SearchIndexStore: Send + Sync {
    /// Replace when `doc.event_version >= stored.event_version`.
    async fn upsert(&self, doc: &SearchDocument) -> Result<WriteOutcome>;

    /// Remove when `stored.event_version <= event_version`; missing row is a noop.
    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        event_version: i64,
    ) -> Result<WriteOutcome>;

    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<SearchDocument>>;

    async fn list(&self) -> Result<Vec<SearchDocument>>;

    async fn truncate(&self) -> Result<u64>;
}

#[async_trait]
pub trait ChronicleStore: Send + Sync {
    /// Replace when `entry.projection_version >= stored.projection_version`.
    async fn upsert(&self, entry: &ChronicleEntry) -> Result<WriteOutcome>;

    async fn delete(&self, id: Uuid, projection_version: i64) -> Result<WriteOutcome>;

    async fn get(&self, id: Uuid) -> Result<Option<ChronicleEntry>>;

    async fn list(&self) -> Result<Vec<ChronicleEntry>>;

    async fn truncate(&self) -> Result<u64>;
}

#[async_trait]
pub trait BasementStore: Send + Sync {
    /// Keyed on `book_id`; replace when `entry.event_version >= stored`.
    async fn upsert(&self, entry: &BasementEntry) -> Result<WriteOutcome>;

    async fn remove(&self, book_id: Uuid, event_version: i64) -> Result<WriteOutcome>;

    async fn get(&self, book_id: Uuid) -> Result<Option<BasementEntry>>;

    async fn list(&self) -> Result<Vec<BasementEntry>>;

    async fn truncate(&self) -> Result<u64>;
}

#[async_trait]
pub trait ProjectionStatusStore: Send + Sync {
    async fn record(&self, status: &ProjectionStatus) -> Result<()>;

    async fn get(&self, projection_name: &str) -> Result<Option<ProjectionStatus>>;
}

// ── Source ────────────────────────────────────────────────────

/// Read access to the authoritative write-side tables.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// `None` when the entity no longer exists (or is soft-deleted).
    async fn search_source(
        &self,
        kind: SearchEntityKind,
        entity_id: &str,
    ) -> Result<Option<SearchSource>>;

    /// All live searchable entities ordered by `(entity_type, entity_id)`.
    async fn search_sources(&self, limit: Option<u32>) -> Result<Vec<SearchSource>>;

    async fn book(&self, book_id: Uuid) -> Result<Option<BookSnapshot>>;

    /// Books currently soft-deleted into the basement, ordered by id.
    async fn basement_books(&self, limit: Option<u32>) -> Result<Vec<BookSnapshot>>;

    async fn chronicle_event(&self, id: Uuid) -> Result<Option<ChronicleSourceEvent>>;

    /// The chronicle log ordered by `(occurred_at, id)`.
    async fn chronicle_events(&self, limit: Option<u32>) -> Result<Vec<ChronicleSourceEvent>>;
}

// ── Environment sentinel ──────────────────────────────────────

#[async_trait]
pub trait SentinelStore: Send + Sync {
    /// Value of `environment_sentinel.env` for `id = 1`, if present.
    async fn environment(&self) -> Result<Option<String>>;
}

/// Fail unless the database sentinel names `expected`.
pub async fn verify_environment(store: &dyn SentinelStore, expected: &str) -> Result<()> {
    match store.environment().await? {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(crate::error::WordloomError::EnvironmentMismatch {
            expected: expected.to_string(),
            found,
        }),
        None => Err(crate::error::WordloomError::EnvironmentMismatch {
            expected: expected.to_string(),
            found: "<missing>".to_string(),
        }),
    }
}

// ── Search sink ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SinkOperation {
    Index(SearchDocument),
    Delete {
        entity_type: String,
        entity_id: String,
        event_version: i64,
    },
}

impl SinkOperation {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Index(_) => "upsert",
            Self::Delete { .. } => "delete",
        }
    }

    /// Document id in the external index.
    pub fn document_id(&self) -> String {
        match self {
            Self::Index(doc) => format!("{}:{}", doc.entity_type, doc.entity_id),
            Self::Delete {
                entity_type,
                entity_id,
                ..
            } => format!("{entity_type}:{entity_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub applied: usize,
    /// Items the sink already had at an equal or newer version.
    pub noops: usize,
}

/// External search index mirrored ahead of the `search_index` write.
#[async_trait]
pub trait SearchSink: Send + Sync {
    async fn bulk(&self, ops: &[SinkOperation]) -> std::result::Result<SinkReport, ProjectionError>;
}

/// Sink used when no external index is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl SearchSink for NullSink {
    async fn bulk(&self, ops: &[SinkOperation]) -> std::result::Result<SinkReport, ProjectionError> {
        Ok(SinkReport {
            applied: ops.len(),
            noops: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSentinel(Option<&'static str>);

    #[async_trait]
    impl SentinelStore for FixedSentinel {
        async fn environment(&self) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    #[tokio::test]
    async fn sentinel_must_match() {
        assert!(verify_environment(&FixedSentinel(Some("dev")), "dev")
            .await
            .is_ok());
        let err = verify_environment(&FixedSentinel(Some("sandbox")), "dev")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sandbox"));
        assert!(verify_environment(&FixedSentinel(None), "test")
            .await
            .is_err());
    }

    #[test]
    fn sink_document_ids_are_typed() {
        let op = SinkOperation::Delete {
            entity_type: "block".into(),
            entity_id: "42".into(),
            event_version: 7,
        };
        assert_eq!(op.document_id(), "block:42");
        assert_eq!(op.op_name(), "delete");
    }
}
