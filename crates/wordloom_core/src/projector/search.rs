use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{payload_object, ApplyOutcome, Projector};
use crate::error::ProjectionError;
use crate::outbox::{OutboxOp, OutboxRow, Projection};
use crate::ports::{Clock, SearchIndexStore, SearchSink, SinkOperation, SourceReader};
use crate::read_model::SearchDocument;
use crate::source::SearchEntityKind;

pub const SNIPPET_CHARS: usize = 200;

/// First [`SNIPPET_CHARS`] code points of the trimmed text.
pub fn snippet(text: &str) -> String {
    text.trim().chars().take(SNIPPET_CHARS).collect()
}

/// `kind weight × (1 + ln(words + 1) / 10)`, rounded to 4 places.
pub fn rank_score(kind: SearchEntityKind, text: &str) -> f64 {
    let words = text.split_whitespace().count() as f64;
    let score = kind.weight() * (1.0 + (words + 1.0).ln() / 10.0);
    (score * 10_000.0).round() / 10_000.0
}

pub fn build_document(
    kind: SearchEntityKind,
    entity_id: &str,
    text: &str,
    event_version: i64,
    now: DateTime<Utc>,
) -> SearchDocument {
    SearchDocument {
        entity_type: kind.as_str().to_string(),
        entity_id: entity_id.to_string(),
        text: text.to_string(),
        snippet: snippet(text),
        rank_score: rank_score(kind, text),
        event_version,
        updated_at: now,
    }
}

/// Maintains `search_index`, mirroring each write to the configured sink first.
pub struct SearchProjector {
    index: Arc<dyn SearchIndexStore>,
    source: Arc<dyn SourceReader>,
    sink: Arc<dyn SearchSink>,
    clock: Arc<dyn Clock>,
    missing_source_limit: u32,
}

impl SearchProjector {
    pub fn new(
        index: Arc<dyn SearchIndexStore>,
        source: Arc<dyn SourceReader>,
        sink: Arc<dyn SearchSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            index,
            source,
            sink,
            clock,
            missing_source_limit: 3,
        }
    }

    pub fn with_missing_source_limit(mut self, limit: u32) -> Self {
        self.missing_source_limit = limit.max(1);
        self
    }

    async fn hydrate(
        &self,
        kind: SearchEntityKind,
        row: &OutboxRow,
    ) -> Result<String, ProjectionError> {
        if let Some(map) = payload_object(row.payload.as_ref())? {
            match map.get("text") {
                None | Some(serde_json::Value::Null) => {}
                Some(serde_json::Value::String(text)) => return Ok(text.clone()),
                Some(_) => return Err(ProjectionError::malformed("payload.text must be a string")),
            }
        }
        let source = self
            .source
            .search_source(kind, &row.entity_id)
            .await?
            .ok_or_else(|| {
                ProjectionError::missing_source(format!(
                    "{} {} not found in source tables",
                    kind.as_str(),
                    row.entity_id
                ))
            })?;
        Ok(source.text)
    }
}

#[async_trait]
impl Projector for SearchProjector {
    fn projection(&self) -> Projection {
        Projection::Search
    }

    fn missing_source_limit(&self) -> u32 {
        self.missing_source_limit
    }

    async fn apply(&self, row: &OutboxRow) -> Result<ApplyOutcome, ProjectionError> {
        let kind = SearchEntityKind::parse(&row.entity_type).ok_or_else(|| {
            ProjectionError::unknown_type(format!(
                "search index does not cover entity_type '{}'",
                row.entity_type
            ))
        })?;

        match row.op {
            OutboxOp::Upsert => {
                let text = self.hydrate(kind, row).await?;
                let doc = build_document(
                    kind,
                    &row.entity_id,
                    &text,
                    row.event_version,
                    self.clock.now(),
                );
                self.sink.bulk(&[SinkOperation::Index(doc.clone())]).await?;
                let outcome = self.index.upsert(&doc).await?;
                debug!(entity_id = %row.entity_id, ?outcome, "search document upserted");
                Ok(outcome.into())
            }
            OutboxOp::Delete => {
                self.sink
                    .bulk(&[SinkOperation::Delete {
                        entity_type: row.entity_type.clone(),
                        entity_id: row.entity_id.clone(),
                        event_version: row.event_version,
                    }])
                    .await?;
                let outcome = self
                    .index
                    .delete(&row.entity_type, &row.entity_id, row.event_version)
                    .await?;
                debug!(entity_id = %row.entity_id, ?outcome, "search document deleted");
                Ok(outcome.into())
            }
        }
    }
}
