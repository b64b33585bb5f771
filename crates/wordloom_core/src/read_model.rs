//! Query-side row shapes maintained by the projectors and the rebuilder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of a version-guarded read-model write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Applied,
    /// Guard rejected the write (older version, or delete of a missing row).
    Noop,
}

impl WriteOutcome {
    pub fn from_rows_affected(rows: u64) -> Self {
        if rows > 0 {
            Self::Applied
        } else {
            Self::Noop
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub entity_type: String,
    pub entity_id: String,
    pub text: String,
    pub snippet: String,
    pub rank_score: f64,
    pub event_version: i64,
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    /// Same content, ignoring `updated_at`.
    pub fn same_content(&self, other: &SearchDocument) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.text == other.text
            && self.snippet == other.snippet
            && self.rank_score == other.rank_score
            && self.event_version == other.event_version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronicleEntry {
    pub id: Uuid,
    pub event_type: String,
    pub book_id: Option<Uuid>,
    pub block_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub summary: String,
    pub projection_version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasementEntry {
    pub id: Uuid,
    pub book_id: Uuid,
    pub library_id: Uuid,
    pub bookshelf_id: Uuid,
    pub previous_bookshelf_id: Option<Uuid>,
    pub title_snapshot: String,
    pub summary_snapshot: Option<String>,
    pub event_version: i64,
    pub moved_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `projection_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionStatus {
    pub projection_name: String,
    pub last_rebuild_started_at: Option<DateTime<Utc>>,
    pub last_rebuild_finished_at: Option<DateTime<Utc>>,
    pub last_rebuild_duration_seconds: Option<f64>,
    pub last_rebuild_success: Option<bool>,
    pub last_rebuild_error: Option<String>,
    pub rows_written: i64,
}

impl ProjectionStatus {
    pub fn succeeded(
        name: &str,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        rows_written: i64,
    ) -> Self {
        Self {
            projection_name: name.to_string(),
            last_rebuild_started_at: Some(started),
            last_rebuild_finished_at: Some(finished),
            last_rebuild_duration_seconds: Some(duration_seconds(started, finished)),
            last_rebuild_success: Some(true),
            last_rebuild_error: None,
            rows_written,
        }
    }

    pub fn failed(
        name: &str,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            projection_name: name.to_string(),
            last_rebuild_started_at: Some(started),
            last_rebuild_finished_at: Some(finished),
            last_rebuild_duration_seconds: Some(duration_seconds(started, finished)),
            last_rebuild_success: Some(false),
            last_rebuild_error: Some(error.into()),
            rows_written: 0,
        }
    }
}

fn duration_seconds(started: DateTime<Utc>, finished: DateTime<Utc>) -> f64 {
    (finished - started)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
