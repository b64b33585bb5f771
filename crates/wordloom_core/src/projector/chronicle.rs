use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{payload_object, ApplyOutcome, Projector};
use crate::error::ProjectionError;
use crate::events::EventType;
use crate::outbox::{OutboxOp, OutboxRow, Projection};
use crate::ports::{ChronicleStore, Clock, SourceReader};
use crate::read_model::ChronicleEntry;
use crate::source::ChronicleSourceEvent;

pub const SCHEMA_VERSION: i64 = 1;
const SUMMARY_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Live,
    Rebuild,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Rebuild => "rebuild",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Self::Live => "chronicle_outbox",
            Self::Rebuild => "chronicle_events",
        }
    }
}

/// Event payload merged over the default envelope. Keys present in the
/// payload win.
pub fn envelope(
    payload: &Value,
    provenance: Provenance,
    actor_id: Option<Uuid>,
) -> Result<Value, ProjectionError> {
    let mut merged = Map::new();
    merged.insert("schema_version".into(), json!(SCHEMA_VERSION));
    merged.insert("provenance".into(), json!(provenance.as_str()));
    merged.insert("source".into(), json!(provenance.source()));
    merged.insert(
        "actor_kind".into(),
        json!(if actor_id.is_some() { "user" } else { "system" }),
    );
    if let Some(map) = payload_object(Some(payload))? {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    Ok(Value::Object(merged))
}

/// One-line, deterministic description of an event.
pub fn summarize(event_type: EventType, payload: &Value) -> String {
    let field = |name: &str| payload.get(name).and_then(Value::as_str);
    let summary = match event_type {
        EventType::BookCreated => match field("title") {
            Some(title) => format!("Book created: {title}"),
            None => "Book created".to_string(),
        },
        EventType::BookRenamed => match field("title") {
            Some(title) => format!("Book renamed to {title}"),
            None => "Book renamed".to_string(),
        },
        EventType::BookMovedToBasement => match field("title_snapshot") {
            Some(title) => format!("Book moved to basement: {title}"),
            None => "Book moved to basement".to_string(),
        },
        EventType::BookRestoredFromBasement => "Book restored from basement".to_string(),
        EventType::BookDeleted => "Book deleted".to_string(),
        EventType::BlockCreated => match field("kind") {
            Some(kind) => format!("Block added ({kind})"),
            None => "Block added".to_string(),
        },
        EventType::BlockUpdated => "Block updated".to_string(),
        EventType::BlockDeleted => "Block deleted".to_string(),
        EventType::BookshelfCreated => match field("name") {
            Some(name) => format!("Bookshelf created: {name}"),
            None => "Bookshelf created".to_string(),
        },
        EventType::TagCreated => match field("name") {
            Some(name) => format!("Tag created: {name}"),
            None => "Tag created".to_string(),
        },
    };
    summary.chars().take(SUMMARY_CHARS).collect()
}

pub fn build_entry(
    event: &ChronicleSourceEvent,
    provenance: Provenance,
    projection_version: i64,
    now: DateTime<Utc>,
) -> Result<ChronicleEntry, ProjectionError> {
    let event_type = EventType::parse(&event.event_type).ok_or_else(|| {
        ProjectionError::unknown_type(format!("unknown chronicle event '{}'", event.event_type))
    })?;
    let payload = envelope(&event.payload, provenance, event.actor_id)?;
    Ok(ChronicleEntry {
        id: event.id,
        event_type: event_type.as_str().to_string(),
        book_id: event.book_id,
        block_id: event.block_id,
        actor_id: event.actor_id,
        occurred_at: event.occurred_at,
        created_at: now,
        summary: summarize(event_type, &event.payload),
        payload,
        projection_version,
        updated_at: now,
    })
}

/// Materialises `chronicle_events` into `chronicle_entries`.
pub struct ChronicleProjector {
    store: Arc<dyn ChronicleStore>,
    source: Arc<dyn SourceReader>,
    clock: Arc<dyn Clock>,
    missing_source_limit: u32,
}

impl ChronicleProjector {
    pub fn new(
        store: Arc<dyn ChronicleStore>,
        source: Arc<dyn SourceReader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            missing_source_limit: 3,
        }
    }

    pub fn with_missing_source_limit(mut self, limit: u32) -> Self {
        self.missing_source_limit = limit.max(1);
        self
    }

    async fn load_event(
        &self,
        id: Uuid,
        row: &OutboxRow,
    ) -> Result<ChronicleSourceEvent, ProjectionError> {
        if let Some(map) = payload_object(row.payload.as_ref())? {
            let event: ChronicleSourceEvent = serde_json::from_value(Value::Object(map.clone()))?;
            if event.id != id {
                return Err(ProjectionError::malformed(format!(
                    "payload id {} does not match entity_id {id}",
                    event.id
                )));
            }
            return Ok(event);
        }
        self.source
            .chronicle_event(id)
            .await?
            .ok_or_else(|| ProjectionError::missing_source(format!("chronicle event {id} not found")))
    }
}

#[async_trait]
impl Projector for ChronicleProjector {
    fn projection(&self) -> Projection {
        Projection::Chronicle
    }

    fn missing_source_limit(&self) -> u32 {
        self.missing_source_limit
    }

    async fn apply(&self, row: &OutboxRow) -> Result<ApplyOutcome, ProjectionError> {
        let id = Uuid::parse_str(&row.entity_id).map_err(|e| {
            ProjectionError::malformed(format!("entity_id '{}' is not a uuid: {e}", row.entity_id))
        })?;
        match row.op {
            OutboxOp::Delete => Ok(self.store.delete(id, row.event_version).await?.into()),
            OutboxOp::Upsert => {
                let event = self.load_event(id, row).await?;
                let entry = build_entry(&event, Provenance::Live, row.event_version, self.clock.now())?;
                Ok(self.store.upsert(&entry).await?.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorReason;

    fn event(event_type: &str, payload: Value) -> ChronicleSourceEvent {
        ChronicleSourceEvent {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            book_id: Some(Uuid::new_v4()),
            block_id: None,
            actor_id: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn envelope_defaults_then_payload() {
        let merged = envelope(&json!({"title": "x", "source": "import"}), Provenance::Live, None)
            .unwrap();
        assert_eq!(merged["schema_version"], 1);
        assert_eq!(merged["provenance"], "live");
        assert_eq!(merged["actor_kind"], "system");
        assert_eq!(merged["source"], "import");
        assert_eq!(merged["title"], "x");
    }

    #[test]
    fn envelope_marks_user_actor() {
        let merged = envelope(&json!({}), Provenance::Rebuild, Some(Uuid::new_v4())).unwrap();
        assert_eq!(merged["actor_kind"], "user");
        assert_eq!(merged["provenance"], "rebuild");
        assert_eq!(merged["source"], "chronicle_events");
    }

    #[test]
    fn summary_is_deterministic() {
        let payload = json!({"title": "Field notes"});
        assert_eq!(
            summarize(EventType::BookCreated, &payload),
            "Book created: Field notes"
        );
        assert_eq!(
            summarize(EventType::BookCreated, &payload),
            summarize(EventType::BookCreated, &payload)
        );
        assert_eq!(summarize(EventType::BlockDeleted, &json!({})), "Block deleted");
    }

    #[test]
    fn summary_is_bounded() {
        let payload = json!({"title": "t".repeat(500)});
        assert_eq!(
            summarize(EventType::BookRenamed, &payload).chars().count(),
            SUMMARY_CHARS
        );
    }

    #[test]
    fn build_entry_rejects_unknown_event_type() {
        let err = build_entry(&event("media_uploaded", json!({})), Provenance::Live, 1, Utc::now())
            .unwrap_err();
        assert_eq!(err.reason, ErrorReason::UnknownEventType);
    }

    #[test]
    fn build_entry_uses_given_version() {
        let ev = event("book_deleted", json!({}));
        let entry = build_entry(&ev, Provenance::Rebuild, 77, Utc::now()).unwrap();
        assert_eq!(entry.id, ev.id);
        assert_eq!(entry.projection_version, 77);
        assert_eq!(entry.summary, "Book deleted");
        assert_eq!(entry.payload["provenance"], "rebuild");
    }
}
