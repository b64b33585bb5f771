//! Domain events emitted by write-side aggregates.
//!
//! Events are immutable values. `EventKind` is a closed tagged sum, so every
//! dispatcher and projector matches over it exhaustively instead of looking up
//! handlers by class name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of aggregate that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Library,
    Bookshelf,
    Book,
    Block,
    Tag,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Library => "library",
            Self::Bookshelf => "bookshelf",
            Self::Book => "book",
            Self::Block => "block",
            Self::Tag => "tag",
        }
    }
}

/// Fieldless discriminant of [`EventKind`]; used as the dispatch key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BookCreated,
    BookRenamed,
    BookMovedToBasement,
    BookRestoredFromBasement,
    BookDeleted,
    BlockCreated,
    BlockUpdated,
    BlockDeleted,
    BookshelfCreated,
    TagCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookCreated => "book_created",
            Self::BookRenamed => "book_renamed",
            Self::BookMovedToBasement => "book_moved_to_basement",
            Self::BookRestoredFromBasement => "book_restored_from_basement",
            Self::BookDeleted => "book_deleted",
            Self::BlockCreated => "block_created",
            Self::BlockUpdated => "block_updated",
            Self::BlockDeleted => "block_deleted",
            Self::BookshelfCreated => "bookshelf_created",
            Self::TagCreated => "tag_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().find(|t| t.as_str() == s)
    }

    pub fn all() -> impl Iterator<Item = EventType> {
        use strum::IntoEnumIterator;
        Self::iter()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    BookCreated {
        book_id: Uuid,
        library_id: Uuid,
        bookshelf_id: Uuid,
        title: String,
    },
    BookRenamed {
        book_id: Uuid,
        title: String,
    },
    BookMovedToBasement {
        book_id: Uuid,
        library_id: Uuid,
        bookshelf_id: Uuid,
        previous_bookshelf_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title_snapshot: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary_snapshot: Option<String>,
    },
    BookRestoredFromBasement {
        book_id: Uuid,
        bookshelf_id: Uuid,
    },
    BookDeleted {
        book_id: Uuid,
    },
    BlockCreated {
        block_id: Uuid,
        book_id: Uuid,
        kind: String,
    },
    BlockUpdated {
        block_id: Uuid,
        book_id: Uuid,
    },
    BlockDeleted {
        block_id: Uuid,
        book_id: Uuid,
    },
    BookshelfCreated {
        bookshelf_id: Uuid,
        library_id: Uuid,
        name: String,
    },
    TagCreated {
        tag_id: Uuid,
        name: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::BookCreated { .. } => EventType::BookCreated,
            Self::BookRenamed { .. } => EventType::BookRenamed,
            Self::BookMovedToBasement { .. } => EventType::BookMovedToBasement,
            Self::BookRestoredFromBasement { .. } => EventType::BookRestoredFromBasement,
            Self::BookDeleted { .. } => EventType::BookDeleted,
            Self::BlockCreated { .. } => EventType::BlockCreated,
            Self::BlockUpdated { .. } => EventType::BlockUpdated,
            Self::BlockDeleted { .. } => EventType::BlockDeleted,
            Self::BookshelfCreated { .. } => EventType::BookshelfCreated,
            Self::TagCreated { .. } => EventType::TagCreated,
        }
    }

    pub fn aggregate_kind(&self) -> AggregateKind {
        match self {
            Self::BookCreated { .. }
            | Self::BookRenamed { .. }
            | Self::BookMovedToBasement { .. }
            | Self::BookRestoredFromBasement { .. }
            | Self::BookDeleted { .. } => AggregateKind::Book,
            Self::BlockCreated { .. } | Self::BlockUpdated { .. } | Self::BlockDeleted { .. } => {
                AggregateKind::Block
            }
            Self::BookshelfCreated { .. } => AggregateKind::Bookshelf,
            Self::TagCreated { .. } => AggregateKind::Tag,
        }
    }

    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::BookCreated { book_id, .. }
            | Self::BookRenamed { book_id, .. }
            | Self::BookMovedToBasement { book_id, .. }
            | Self::BookRestoredFromBasement { book_id, .. }
            | Self::BookDeleted { book_id } => *book_id,
            Self::BlockCreated { block_id, .. }
            | Self::BlockUpdated { block_id, .. }
            | Self::BlockDeleted { block_id, .. } => *block_id,
            Self::BookshelfCreated { bookshelf_id, .. } => *bookshelf_id,
            Self::TagCreated { tag_id, .. } => *tag_id,
        }
    }

    /// Book the event belongs to, for per-book timelines.
    pub fn book_id(&self) -> Option<Uuid> {
        match self {
            Self::BookCreated { book_id, .. }
            | Self::BookRenamed { book_id, .. }
            | Self::BookMovedToBasement { book_id, .. }
            | Self::BookRestoredFromBasement { book_id, .. }
            | Self::BookDeleted { book_id }
            | Self::BlockCreated { book_id, .. }
            | Self::BlockUpdated { book_id, .. }
            | Self::BlockDeleted { book_id, .. } => Some(*book_id),
            Self::BookshelfCreated { .. } | Self::TagCreated { .. } => None,
        }
    }

    pub fn block_id(&self) -> Option<Uuid> {
        match self {
            Self::BlockCreated { block_id, .. }
            | Self::BlockUpdated { block_id, .. }
            | Self::BlockDeleted { block_id, .. } => Some(*block_id),
            _ => None,
        }
    }
}

/// A domain event as recorded by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            actor_id: None,
            kind,
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn aggregate_kind(&self) -> AggregateKind {
        self.kind.aggregate_kind()
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.kind.aggregate_id()
    }

    /// Event fields as a JSON mapping, without the `event_type` tag.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.kind).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("event_type");
        }
        value
    }
}

/// Aggregate-local buffer of recorded events.
///
/// Events stay here until the owning aggregate (and its outbox rows) has been
/// committed; only then does the repository drain and publish them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EventBuffer {
    pending: Vec<DomainEvent>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EventKind) -> &DomainEvent {
        self.pending.push(DomainEvent::new(kind));
        &self.pending[self.pending.len() - 1]
    }

    pub fn push(&mut self, event: DomainEvent) {
        self.pending.push(event);
    }

    pub fn peek(&self) -> &[DomainEvent] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn drain(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending)
    }
}
