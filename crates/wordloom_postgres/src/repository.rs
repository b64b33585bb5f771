//! Minimal write-side repositories.
//!
//! Each save writes the aggregate row, its search outbox row and the
//! chronicle record of every buffered event in one transaction. After
//! commit the events are drained and published on the bus for in-process
//! effects (the basement projection); a failing handler never fails the
//! write.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use wordloom_core::aggregate::{Block, Book};
use wordloom_core::error::Result;
use wordloom_core::events::{DomainEvent, EventBuffer};
use wordloom_core::outbox::{next_event_version, EnqueueRequest, Projection};
use wordloom_core::trace::TraceContext;

use crate::bus::EventBus;
use crate::chronicle::record_all;
use crate::error::db_err;
use crate::outbox::OutboxBatch;
use crate::source::load_book;

async fn publish_after_commit(
    bus: Option<&Arc<EventBus>>,
    events: &[DomainEvent],
    trace: Option<&TraceContext>,
) {
    let Some(bus) = bus else { return };
    if events.is_empty() {
        return;
    }
    match bus.publish(events, trace.cloned()).await {
        Ok(report) if !report.is_clean() => {
            warn!(failures = report.failures(), "event bus reported handler failures")
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "event bus publish failed after commit"),
    }
}

fn search_request(
    entity_type: &str,
    entity_id: Uuid,
    delete: bool,
    events: &EventBuffer,
    trace: Option<&TraceContext>,
) -> EnqueueRequest {
    let request = if delete {
        EnqueueRequest::delete(entity_type, entity_id)
    } else {
        EnqueueRequest::upsert(entity_type, entity_id)
    };
    let request = request
        .with_version(next_event_version())
        .with_trace(trace.map(TraceContext::child));
    match events.peek().last() {
        Some(event) => request.with_event_type(event.event_type().as_str()),
        None => request,
    }
}

// ── Books ─────────────────────────────────────────────────────

pub struct PgBookRepository {
    pool: PgPool,
    bus: Option<Arc<EventBus>>,
}

impl PgBookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, bus: None }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<Book>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        Ok(load_book(&mut conn, id).await?.map(|b| Book {
            id: b.id,
            library_id: b.library_id,
            bookshelf_id: b.bookshelf_id,
            previous_bookshelf_id: b.previous_bookshelf_id,
            title: b.title,
            summary: b.summary,
            soft_deleted_at: b.soft_deleted_at,
            events: EventBuffer::new(),
        }))
    }

    /// Insert or update the book row; a book in the basement is removed from search.
    pub async fn save(
        &self,
        book: &mut Book,
        trace: Option<&TraceContext>,
    ) -> Result<Vec<DomainEvent>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_book(&mut tx, book).await?;
        let mut batch = OutboxBatch::new();
        batch
            .enqueue(
                &mut tx,
                Projection::Search,
                search_request("book", book.id, book.is_in_basement(), &book.events, trace),
            )
            .await?;
        record_all(&mut tx, &mut batch, book.events.peek(), trace).await?;
        tx.commit().await.map_err(db_err)?;
        batch.committed();

        let events = book.events.drain();
        publish_after_commit(self.bus.as_ref(), &events, trace).await;
        Ok(events)
    }

    /// Hard delete. Records `BookDeleted` and removes the book from search.
    pub async fn delete(
        &self,
        book: &mut Book,
        trace: Option<&TraceContext>,
    ) -> Result<Vec<DomainEvent>> {
        book.delete();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(book.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let mut batch = OutboxBatch::new();
        batch
            .enqueue(
                &mut tx,
                Projection::Search,
                search_request("book", book.id, true, &book.events, trace),
            )
            .await?;
        record_all(&mut tx, &mut batch, book.events.peek(), trace).await?;
        tx.commit().await.map_err(db_err)?;
        batch.committed();

        let events = book.events.drain();
        publish_after_commit(self.bus.as_ref(), &events, trace).await;
        Ok(events)
    }
}

async fn write_book(conn: &mut PgConnection, book: &Book) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO books (
            id, library_id, bookshelf_id, previous_bookshelf_id, title, summary,
            soft_deleted_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (id) DO UPDATE
        SET bookshelf_id = EXCLUDED.bookshelf_id,
            previous_bookshelf_id = EXCLUDED.previous_bookshelf_id,
            title = EXCLUDED.title,
            summary = EXCLUDED.summary,
            soft_deleted_at = EXCLUDED.soft_deleted_at,
            updated_at = now()
        "#,
    )
    .bind(book.id)
    .bind(book.library_id)
    .bind(book.bookshelf_id)
    .bind(book.previous_bookshelf_id)
    .bind(&book.title)
    .bind(&book.summary)
    .bind(book.soft_deleted_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ── Blocks ────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgBlockRow {
    id: Uuid,
    book_id: Uuid,
    kind: String,
    content: String,
    order_key: Decimal,
}

pub struct PgBlockRepository {
    pool: PgPool,
    bus: Option<Arc<EventBus>>,
}

impl PgBlockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, bus: None }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<Block>> {
        let row = sqlx::query_as::<_, PgBlockRow>(
            r#"
            SELECT id, book_id, kind, content, order_key
            FROM blocks
            WHERE id = $1 AND soft_deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| Block {
            id: r.id,
            book_id: r.book_id,
            kind: r.kind,
            content: r.content,
            order_key: r.order_key,
            events: EventBuffer::new(),
        }))
    }

    /// Blocks of a book in fractional-index order.
    pub async fn list_for_book(&self, book_id: Uuid) -> Result<Vec<Block>> {
        let rows = sqlx::query_as::<_, PgBlockRow>(
            r#"
            SELECT id, book_id, kind, content, order_key
            FROM blocks
            WHERE book_id = $1 AND soft_deleted_at IS NULL
            ORDER BY order_key, id
            "#,
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| Block {
                id: r.id,
                book_id: r.book_id,
                kind: r.kind,
                content: r.content,
                order_key: r.order_key,
                events: EventBuffer::new(),
            })
            .collect())
    }

    pub async fn save(
        &self,
        block: &mut Block,
        trace: Option<&TraceContext>,
    ) -> Result<Vec<DomainEvent>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO blocks (id, book_id, kind, content, order_key, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (id) DO UPDATE
            SET kind = EXCLUDED.kind,
                content = EXCLUDED.content,
                order_key = EXCLUDED.order_key,
                updated_at = now()
            "#,
        )
        .bind(block.id)
        .bind(block.book_id)
        .bind(&block.kind)
        .bind(&block.content)
        .bind(block.order_key)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let mut batch = OutboxBatch::new();
        batch
            .enqueue(
                &mut tx,
                Projection::Search,
                search_request("block", block.id, false, &block.events, trace)
                    .with_payload(serde_json::json!({ "text": block.content })),
            )
            .await?;
        record_all(&mut tx, &mut batch, block.events.peek(), trace).await?;
        tx.commit().await.map_err(db_err)?;
        batch.committed();

        let events = block.events.drain();
        publish_after_commit(self.bus.as_ref(), &events, trace).await;
        Ok(events)
    }

    /// Soft delete; the block leaves the search index.
    pub async fn delete(
        &self,
        block: &mut Block,
        trace: Option<&TraceContext>,
    ) -> Result<Vec<DomainEvent>> {
        block.delete();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE blocks SET soft_deleted_at = now(), updated_at = now() WHERE id = $1")
            .bind(block.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let mut batch = OutboxBatch::new();
        batch
            .enqueue(
                &mut tx,
                Projection::Search,
                search_request("block", block.id, true, &block.events, trace),
            )
            .await?;
        record_all(&mut tx, &mut batch, block.events.peek(), trace).await?;
        tx.commit().await.map_err(db_err)?;
        batch.committed();

        let events = block.events.drain();
        publish_after_commit(self.bus.as_ref(), &events, trace).await;
        Ok(events)
    }
}
