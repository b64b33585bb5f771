//! Authoritative write-side data as the projectors see it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity types the search index covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEntityKind {
    Book,
    Block,
    Bookshelf,
    Tag,
}

impl SearchEntityKind {
    pub const ALL: [SearchEntityKind; 4] = [Self::Block, Self::Book, Self::Bookshelf, Self::Tag];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Block => "block",
            Self::Bookshelf => "bookshelf",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "book" => Some(Self::Book),
            "block" => Some(Self::Block),
            "bookshelf" => Some(Self::Bookshelf),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }

    /// Relative weight used by the rank heuristic.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Book => 1.0,
            Self::Bookshelf => 0.8,
            Self::Block => 0.6,
            Self::Tag => 0.5,
        }
    }
}

/// Current searchable content of one source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSource {
    pub kind: SearchEntityKind,
    pub entity_id: String,
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub id: Uuid,
    pub library_id: Uuid,
    pub bookshelf_id: Uuid,
    pub previous_bookshelf_id: Option<Uuid>,
    pub title: String,
    pub summary: Option<String>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only `chronicle_events` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronicleSourceEvent {
    pub id: Uuid,
    pub event_type: String,
    pub book_id: Option<Uuid>,
    pub block_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChronicleSourceEvent {
    pub fn from_domain(event: &crate::events::DomainEvent) -> Self {
        Self {
            id: event.event_id,
            event_type: event.event_type().as_str().to_string(),
            book_id: event.kind.book_id(),
            block_id: event.kind.block_id(),
            actor_id: event.actor_id,
            occurred_at: event.occurred_at,
            payload: event.payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_back() {
        for kind in SearchEntityKind::ALL {
            assert_eq!(SearchEntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SearchEntityKind::parse("media"), None);
    }

    #[test]
    fn all_is_sorted_by_name() {
        let names: Vec<_> = SearchEntityKind::ALL.iter().map(|k| k.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
