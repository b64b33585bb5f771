//! Minimal write-side aggregates that feed the projection pipeline.
//!
//! Only the behaviour the pipeline depends on lives here: state changes that
//! emit events. Title validation and other business rules belong to the
//! owning services.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, WordloomError};
use crate::events::{EventBuffer, EventKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub id: Uuid,
    pub library_id: Uuid,
    pub bookshelf_id: Uuid,
    pub previous_bookshelf_id: Option<Uuid>,
    pub title: String,
    pub summary: Option<String>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub events: EventBuffer,
}

impl Book {
    pub fn create(library_id: Uuid, bookshelf_id: Uuid, title: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let title = title.into();
        let mut events = EventBuffer::new();
        events.record(EventKind::BookCreated {
            book_id: id,
            library_id,
            bookshelf_id,
            title: title.clone(),
        });
        Self {
            id,
            library_id,
            bookshelf_id,
            previous_bookshelf_id: None,
            title,
            summary: None,
            soft_deleted_at: None,
            events,
        }
    }

    pub fn is_in_basement(&self) -> bool {
        self.soft_deleted_at.is_some()
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        let title = title.into();
        if title == self.title {
            return;
        }
        self.title = title.clone();
        self.events.record(EventKind::BookRenamed {
            book_id: self.id,
            title,
        });
    }

    pub fn move_to_basement(&mut self, basement_bookshelf_id: Uuid) -> Result<()> {
        if self.is_in_basement() {
            return Err(WordloomError::InvalidInput(format!(
                "book {} is already in the basement",
                self.id
            )));
        }
        let previous = self.bookshelf_id;
        self.previous_bookshelf_id = Some(previous);
        self.bookshelf_id = basement_bookshelf_id;
        self.soft_deleted_at = Some(Utc::now());
        self.events.record(EventKind::BookMovedToBasement {
            book_id: self.id,
            library_id: self.library_id,
            bookshelf_id: basement_bookshelf_id,
            previous_bookshelf_id: previous,
            title_snapshot: Some(self.title.clone()),
            summary_snapshot: self.summary.clone(),
        });
        Ok(())
    }

    /// Restore to `target`, or to the shelf the book came from.
    pub fn restore_from_basement(&mut self, target: Option<Uuid>) -> Result<()> {
        if !self.is_in_basement() {
            return Err(WordloomError::InvalidInput(format!(
                "book {} is not in the basement",
                self.id
            )));
        }
        let bookshelf_id = target.or(self.previous_bookshelf_id).ok_or_else(|| {
            WordloomError::InvalidInput(format!("book {} has no shelf to return to", self.id))
        })?;
        self.bookshelf_id = bookshelf_id;
        self.previous_bookshelf_id = None;
        self.soft_deleted_at = None;
        self.events.record(EventKind::BookRestoredFromBasement {
            book_id: self.id,
            bookshelf_id,
        });
        Ok(())
    }

    pub fn delete(&mut self) {
        self.events.record(EventKind::BookDeleted { book_id: self.id });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: Uuid,
    pub book_id: Uuid,
    pub kind: String,
    pub content: String,
    /// Fractional index; ordering policy belongs to the block service.
    pub order_key: Decimal,
    pub events: EventBuffer,
}

impl Block {
    pub fn create(
        book_id: Uuid,
        kind: impl Into<String>,
        content: impl Into<String>,
        order_key: Decimal,
    ) -> Self {
        let id = Uuid::new_v4();
        let kind = kind.into();
        let mut events = EventBuffer::new();
        events.record(EventKind::BlockCreated {
            block_id: id,
            book_id,
            kind: kind.clone(),
        });
        Self {
            id,
            book_id,
            kind,
            content: content.into(),
            order_key,
            events,
        }
    }

    pub fn update_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.events.record(EventKind::BlockUpdated {
            block_id: self.id,
            book_id: self.book_id,
        });
    }

    pub fn delete(&mut self) {
        self.events.record(EventKind::BlockDeleted {
            block_id: self.id,
            book_id: self.book_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[test]
    fn create_records_single_event() {
        let book = Book::create(Uuid::new_v4(), Uuid::new_v4(), "quantum entanglement");
        let types: Vec<_> = book.events.peek().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::BookCreated]);
    }

    #[test]
    fn rename_to_same_title_is_silent() {
        let mut book = Book::create(Uuid::new_v4(), Uuid::new_v4(), "a");
        book.events.drain();
        book.rename("a");
        assert!(book.events.is_empty());
        book.rename("b");
        assert_eq!(book.events.len(), 1);
    }

    #[test]
    fn basement_round_trip_returns_to_previous_shelf() {
        let shelf = Uuid::new_v4();
        let basement = Uuid::new_v4();
        let mut book = Book::create(Uuid::new_v4(), shelf, "notes");
        book.move_to_basement(basement).unwrap();
        assert!(book.is_in_basement());
        assert_eq!(book.previous_bookshelf_id, Some(shelf));
        assert!(book.move_to_basement(basement).is_err());

        book.restore_from_basement(None).unwrap();
        assert_eq!(book.bookshelf_id, shelf);
        assert!(!book.is_in_basement());

        let types: Vec<_> = book.events.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                EventType::BookCreated,
                EventType::BookMovedToBasement,
                EventType::BookRestoredFromBasement
            ]
        );
    }

    #[test]
    fn restore_outside_basement_is_rejected() {
        let mut book = Book::create(Uuid::new_v4(), Uuid::new_v4(), "x");
        assert!(book.restore_from_basement(None).is_err());
    }

    #[test]
    fn block_keeps_decimal_order_key() {
        let key = Decimal::new(15, 1);
        let block = Block::create(Uuid::new_v4(), "paragraph", "text", key);
        assert_eq!(block.order_key, key);
        assert_eq!(block.events.len(), 1);
    }
}
