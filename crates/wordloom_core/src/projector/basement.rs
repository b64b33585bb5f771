use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ProjectionError;
use crate::events::{DomainEvent, EventKind};
use crate::outbox::version_from_timestamp;
use crate::read_model::BasementEntry;
use crate::source::BookSnapshot;

/// Basement snapshot as carried by the event, possibly incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct BasementDraft {
    pub book_id: Uuid,
    pub library_id: Uuid,
    pub bookshelf_id: Uuid,
    pub previous_bookshelf_id: Option<Uuid>,
    pub title_snapshot: Option<String>,
    pub summary_snapshot: Option<String>,
    pub event_version: i64,
    pub moved_at: DateTime<Utc>,
}

impl BasementDraft {
    pub fn needs_source(&self) -> bool {
        self.title_snapshot.is_none() || self.summary_snapshot.is_none()
    }

    /// Fill missing snapshot fields from the current `books` row.
    pub fn complete(
        self,
        book: Option<&BookSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<BasementEntry, ProjectionError> {
        let title_snapshot = match (self.title_snapshot, book) {
            (Some(title), _) => title,
            (None, Some(book)) => book.title.clone(),
            (None, None) => {
                return Err(ProjectionError::missing_source(format!(
                    "book {} has no title snapshot and no source row",
                    self.book_id
                )))
            }
        };
        let summary_snapshot = self
            .summary_snapshot
            .or_else(|| book.and_then(|b| b.summary.clone()));
        Ok(BasementEntry {
            id: Uuid::new_v4(),
            book_id: self.book_id,
            library_id: self.library_id,
            bookshelf_id: self.bookshelf_id,
            previous_bookshelf_id: self.previous_bookshelf_id,
            title_snapshot,
            summary_snapshot,
            event_version: self.event_version,
            moved_at: self.moved_at,
            updated_at: now,
        })
    }

    /// Draft for a book already sitting in the basement; used by rebuilds.
    pub fn from_book(book: &BookSnapshot) -> Self {
        Self {
            book_id: book.id,
            library_id: book.library_id,
            bookshelf_id: book.bookshelf_id,
            previous_bookshelf_id: book.previous_bookshelf_id,
            title_snapshot: Some(book.title.clone()),
            summary_snapshot: book.summary.clone(),
            event_version: version_from_timestamp(book.updated_at),
            moved_at: book.soft_deleted_at.unwrap_or(book.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasementMutation {
    Upsert(BasementDraft),
    Remove { book_id: Uuid, event_version: i64 },
}

/// Basement effect of an event, if any. Versions come from `occurred_at`.
pub fn mutation_for(event: &DomainEvent) -> Option<BasementMutation> {
    let event_version = version_from_timestamp(event.occurred_at);
    match &event.kind {
        EventKind::BookMovedToBasement {
            book_id,
            library_id,
            bookshelf_id,
            previous_bookshelf_id,
            title_snapshot,
            summary_snapshot,
        } => Some(BasementMutation::Upsert(BasementDraft {
            book_id: *book_id,
            library_id: *library_id,
            bookshelf_id: *bookshelf_id,
            previous_bookshelf_id: Some(*previous_bookshelf_id),
            title_snapshot: title_snapshot.clone(),
            summary_snapshot: summary_snapshot.clone(),
            event_version,
            moved_at: event.occurred_at,
        })),
        EventKind::BookRestoredFromBasement { book_id, .. } | EventKind::BookDeleted { book_id } => {
            Some(BasementMutation::Remove {
                book_id: *book_id,
                event_version,
            })
        }
        EventKind::BookCreated { .. }
        | EventKind::BookRenamed { .. }
        | EventKind::BlockCreated { .. }
        | EventKind::BlockUpdated { .. }
        | EventKind::BlockDeleted { .. }
        | EventKind::BookshelfCreated { .. }
        | EventKind::TagCreated { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorReason;

    fn moved(title: Option<&str>) -> DomainEvent {
        DomainEvent::new(EventKind::BookMovedToBasement {
            book_id: Uuid::new_v4(),
            library_id: Uuid::new_v4(),
            bookshelf_id: Uuid::new_v4(),
            previous_bookshelf_id: Uuid::new_v4(),
            title_snapshot: title.map(str::to_string),
            summary_snapshot: None,
        })
    }

    fn snapshot(book_id: Uuid) -> BookSnapshot {
        BookSnapshot {
            id: book_id,
            library_id: Uuid::new_v4(),
            bookshelf_id: Uuid::new_v4(),
            previous_bookshelf_id: None,
            title: "From books".into(),
            summary: Some("recovered".into()),
            soft_deleted_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn move_produces_upsert_versioned_by_occurrence() {
        let event = moved(Some("Notes"));
        let Some(BasementMutation::Upsert(draft)) = mutation_for(&event) else {
            panic!("expected upsert");
        };
        assert_eq!(draft.event_version, event.occurred_at.timestamp_micros());
        assert_eq!(draft.title_snapshot.as_deref(), Some("Notes"));
    }

    #[test]
    fn restore_and_delete_remove() {
        let book_id = Uuid::new_v4();
        let restore = DomainEvent::new(EventKind::BookRestoredFromBasement {
            book_id,
            bookshelf_id: Uuid::new_v4(),
        });
        assert!(matches!(
            mutation_for(&restore),
            Some(BasementMutation::Remove { book_id: id, .. }) if id == book_id
        ));
        let delete = DomainEvent::new(EventKind::BookDeleted { book_id });
        assert!(matches!(
            mutation_for(&delete),
            Some(BasementMutation::Remove { .. })
        ));
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let event = DomainEvent::new(EventKind::TagCreated {
            tag_id: Uuid::new_v4(),
            name: "physics".into(),
        });
        assert_eq!(mutation_for(&event), None);
    }

    #[test]
    fn complete_reads_through_missing_fields() {
        let Some(BasementMutation::Upsert(draft)) = mutation_for(&moved(None)) else {
            panic!("expected upsert");
        };
        assert!(draft.needs_source());
        let book = snapshot(draft.book_id);
        let entry = draft.complete(Some(&book), Utc::now()).unwrap();
        assert_eq!(entry.title_snapshot, "From books");
        assert_eq!(entry.summary_snapshot.as_deref(), Some("recovered"));
    }

    #[test]
    fn complete_without_title_or_source_is_missing_source() {
        let Some(BasementMutation::Upsert(draft)) = mutation_for(&moved(None)) else {
            panic!("expected upsert");
        };
        let err = draft.complete(None, Utc::now()).unwrap_err();
        assert_eq!(err.reason, ErrorReason::MissingSource);
    }

    #[test]
    fn event_snapshot_wins_over_source() {
        let Some(BasementMutation::Upsert(draft)) = mutation_for(&moved(Some("Event title")))
        else {
            panic!("expected upsert");
        };
        let book = snapshot(draft.book_id);
        let entry = draft.complete(Some(&book), Utc::now()).unwrap();
        assert_eq!(entry.title_snapshot, "Event title");
        assert_eq!(entry.summary_snapshot.as_deref(), Some("recovered"));
    }
}
