//! Outbox row model shared by the writer, the worker and the ops tools.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorReason, WordloomError};
use crate::trace::TraceContext;

// ── Enums ─────────────────────────────────────────────────────

/// Projection family; each family owns one outbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    Search,
    Chronicle,
    Basement,
}

impl Projection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Chronicle => "chronicle",
            Self::Basement => "basement",
        }
    }

    /// Outbox table backing this family. Basement is maintained in-process
    /// by the event bus and has no outbox.
    pub fn outbox_table(&self) -> Option<&'static str> {
        match self {
            Self::Search => Some("search_outbox_events"),
            Self::Chronicle => Some("chronicle_outbox_events"),
            Self::Basement => None,
        }
    }

    /// Name used in `projection_status` and metric labels.
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Search => "search_index",
            Self::Chronicle => "chronicle_entries",
            Self::Basement => "basement_entries",
        }
    }
}

impl std::str::FromStr for Projection {
    type Err = WordloomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "chronicle" => Ok(Self::Chronicle),
            "basement" => Ok(Self::Basement),
            other => Err(WordloomError::InvalidInput(format!(
                "unknown projection '{other}' (expected search | chronicle | basement)"
            ))),
        }
    }
}

impl std::fmt::Display for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl OutboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Allowed lifecycle edges. `Failed → Pending` is only reachable through
    /// an operator replay.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Done)
                | (Self::Processing, Self::Pending)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Event versions ────────────────────────────────────────────

static LAST_EVENT_VERSION: AtomicI64 = AtomicI64::new(0);

/// Microsecond clock that never repeats or goes backwards within a process.
pub fn next_event_version() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_EVENT_VERSION.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_EVENT_VERSION.compare_exchange_weak(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(seen) => last = seen,
        }
    }
}

/// Version derived from a source timestamp; used by rebuilds so repeated runs
/// over the same source produce identical read-model rows.
pub fn version_from_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

// ── Rows ──────────────────────────────────────────────────────

/// Request to enqueue one projection job.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: String,
    pub op: OutboxOp,
    pub event_version: Option<i64>,
    pub payload: Option<serde_json::Value>,
    /// Label for `outbox_produced_total`; defaults to the op.
    pub event_type: Option<String>,
    pub trace: Option<TraceContext>,
}

impl EnqueueRequest {
    pub fn new(entity_type: impl Into<String>, entity_id: impl ToString, op: OutboxOp) -> Self {
        Self {
            id: None,
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            op,
            event_version: None,
            payload: None,
            event_type: None,
            trace: None,
        }
    }

    pub fn upsert(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self::new(entity_type, entity_id, OutboxOp::Upsert)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self::new(entity_type, entity_id, OutboxOp::Delete)
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_version(mut self, event_version: i64) -> Self {
        self.event_version = Some(event_version);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_trace(mut self, trace: Option<TraceContext>) -> Self {
        self.trace = trace;
        self
    }

    pub fn event_type_label(&self) -> &str {
        self.event_type.as_deref().unwrap_or(self.op.as_str())
    }

    pub fn validate(&self) -> Result<(), WordloomError> {
        if self.entity_type.trim().is_empty() {
            return Err(WordloomError::InvalidInput("entity_type is empty".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(WordloomError::InvalidInput("entity_id is empty".into()));
        }
        if let Some(v) = self.event_version {
            if v < 0 {
                return Err(WordloomError::InvalidInput(format!(
                    "event_version must be non-negative, got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve defaults into a concrete `pending` row.
    pub fn into_row(self, now: DateTime<Utc>) -> OutboxRow {
        OutboxRow {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            op: self.op,
            event_version: self.event_version.unwrap_or_else(next_event_version),
            payload: self.payload,
            status: OutboxStatus::Pending,
            owner: None,
            lease_until: None,
            processing_started_at: None,
            attempts: 0,
            next_retry_at: None,
            error_reason: None,
            error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            replay_count: 0,
            last_replayed_at: None,
            last_replayed_by: None,
            last_replayed_reason: None,
            traceparent: self.trace.as_ref().map(TraceContext::traceparent),
            tracestate: self.trace.and_then(|t| t.tracestate),
        }
    }
}

/// One row of a `*_outbox_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub op: OutboxOp,
    pub event_version: i64,
    pub payload: Option<serde_json::Value>,
    pub status: OutboxStatus,
    pub owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub replay_count: i32,
    pub last_replayed_at: Option<DateTime<Utc>>,
    pub last_replayed_by: Option<String>,
    pub last_replayed_reason: Option<String>,
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
}

impl OutboxRow {
    /// Visible to `claim_batch` at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.map_or(true, |t| t <= now)
    }

    /// `processing` rows must hold a live lease taken after processing began.
    pub fn lease_invariant_holds(&self) -> bool {
        if self.status != OutboxStatus::Processing {
            return true;
        }
        match (&self.owner, self.lease_until, self.processing_started_at) {
            (Some(_), Some(lease), Some(started)) => lease > started,
            _ => false,
        }
    }

    pub fn trace_context(&self) -> Option<TraceContext> {
        let parent = self.traceparent.as_deref()?;
        TraceContext::parse(parent, self.tracestate.as_deref()).ok()
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.error_reason.as_deref().and_then(ErrorReason::parse)
    }
}

/// Failure recorded against a row when it is retried or failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFailure {
    pub reason: ErrorReason,
    pub message: String,
}

impl RowFailure {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8(&mut message, MAX_ERROR_LEN);
        Self { reason, message }
    }
}

const MAX_ERROR_LEN: usize = 2000;

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Point-in-time backlog figures for the lag gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BacklogStats {
    /// Rows not yet `done`/`failed`.
    pub lag_events: i64,
    pub oldest_age_seconds: f64,
    pub inflight_events: i64,
    /// `processing` rows older than the max processing window.
    pub stuck_events: i64,
}

// ── Replay ────────────────────────────────────────────────────

/// Which `failed` rows an operator replay selects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayFilter {
    pub entity_type: Option<String>,
    pub since_hours: Option<u32>,
    pub ids: Vec<Uuid>,
    pub limit: Option<u32>,
}

impl ReplayFilter {
    pub fn matches(&self, row: &OutboxRow, now: DateTime<Utc>) -> bool {
        if row.status != OutboxStatus::Failed {
            return false;
        }
        if let Some(et) = &self.entity_type {
            if &row.entity_type != et {
                return false;
            }
        }
        if let Some(hours) = self.since_hours {
            if row.updated_at < now - chrono::Duration::hours(i64::from(hours)) {
                return false;
            }
        }
        self.ids.is_empty() || self.ids.contains(&row.id)
    }
}

/// Audit fields every replay must carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayAudit {
    pub by: String,
    pub reason: String,
}

impl ReplayAudit {
    pub fn new(by: impl Into<String>, reason: impl Into<String>) -> Result<Self, WordloomError> {
        let by = by.into().trim().to_string();
        let reason = reason.into().trim().to_string();
        if by.is_empty() {
            return Err(WordloomError::InvalidInput("--by must not be blank".into()));
        }
        if reason.is_empty() {
            return Err(WordloomError::InvalidInput(
                "--reason must not be blank".into(),
            ));
        }
        Ok(Self { by, reason })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayOutcome {
    pub matched: u64,
    pub replayed: Vec<Uuid>,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag() {
        use OutboxStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn event_versions_strictly_increase() {
        let mut last = next_event_version();
        for _ in 0..1000 {
            let v = next_event_version();
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn new_row_starts_pending() {
        let row = EnqueueRequest::upsert("book", Uuid::new_v4())
            .with_version(42)
            .into_row(Utc::now());
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.replay_count, 0);
        assert_eq!(row.event_version, 42);
        assert!(row.is_claimable(Utc::now()));
    }

    #[test]
    fn retry_window_hides_row() {
        let now = Utc::now();
        let mut row = EnqueueRequest::delete("block", "b1").into_row(now);
        row.next_retry_at = Some(now + chrono::Duration::seconds(5));
        assert!(!row.is_claimable(now));
        assert!(row.is_claimable(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn lease_invariant() {
        let now = Utc::now();
        let mut row = EnqueueRequest::upsert("book", "b").into_row(now);
        row.status = OutboxStatus::Processing;
        assert!(!row.lease_invariant_holds());
        row.owner = Some("w1".into());
        row.processing_started_at = Some(now);
        row.lease_until = Some(now + chrono::Duration::seconds(60));
        assert!(row.lease_invariant_holds());
    }

    #[test]
    fn validate_rejects_blank_keys() {
        assert!(EnqueueRequest::upsert("", "x").validate().is_err());
        assert!(EnqueueRequest::upsert("book", " ").validate().is_err());
        assert!(EnqueueRequest::upsert("book", "x")
            .with_version(-1)
            .validate()
            .is_err());
        assert!(EnqueueRequest::upsert("book", "x").validate().is_ok());
    }

    #[test]
    fn replay_audit_requires_both_fields() {
        assert!(ReplayAudit::new("alice", "fixed projector").is_ok());
        assert!(ReplayAudit::new(" ", "r").is_err());
        assert!(ReplayAudit::new("alice", "").is_err());
    }

    #[test]
    fn replay_filter_matches_failed_only() {
        let now = Utc::now();
        let mut row = EnqueueRequest::upsert("book", "b").into_row(now);
        let filter = ReplayFilter::default();
        assert!(!filter.matches(&row, now));
        row.status = OutboxStatus::Failed;
        assert!(filter.matches(&row, now));

        let by_type = ReplayFilter {
            entity_type: Some("block".into()),
            ..Default::default()
        };
        assert!(!by_type.matches(&row, now));

        let by_id = ReplayFilter {
            ids: vec![Uuid::new_v4()],
            ..Default::default()
        };
        assert!(!by_id.matches(&row, now));

        row.updated_at = now - chrono::Duration::hours(5);
        let recent = ReplayFilter {
            since_hours: Some(2),
            ..Default::default()
        };
        assert!(!recent.matches(&row, now));
    }

    #[test]
    fn failure_message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let failure = RowFailure::new(ErrorReason::Unhandled, long);
        assert!(failure.message.len() <= MAX_ERROR_LEN);
        assert!(failure.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn projection_parses_case_insensitively() {
        assert_eq!("Search".parse::<Projection>().unwrap(), Projection::Search);
        assert!("metrics".parse::<Projection>().is_err());
        assert_eq!(Projection::Basement.outbox_table(), None);
    }
}
