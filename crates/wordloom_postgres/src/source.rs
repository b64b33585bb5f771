//! Reads of the authoritative write-side tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use wordloom_core::error::{Result, WordloomError};
use wordloom_core::ports::SourceReader;
use wordloom_core::source::{BookSnapshot, ChronicleSourceEvent, SearchEntityKind, SearchSource};

use crate::error::db_err;

/// Union of every searchable entity as `(entity_type, entity_id, text, updated_at)`.
const SEARCH_SOURCES: &str = r#"
    SELECT 'block' AS entity_type, id::text AS entity_id, content AS text, updated_at
    FROM blocks WHERE soft_deleted_at IS NULL
    UNION ALL
    SELECT 'book', id::text, concat_ws(E'\n', title, summary), updated_at
    FROM books WHERE soft_deleted_at IS NULL
    UNION ALL
    SELECT 'bookshelf', id::text, concat_ws(E'\n', name, description), updated_at
    FROM bookshelves WHERE NOT is_basement
    UNION ALL
    SELECT 'tag', id::text, concat_ws(E'\n', name, description), updated_at
    FROM tags
"#;

#[derive(Debug, sqlx::FromRow)]
struct PgSearchSourceRow {
    entity_type: String,
    entity_id: String,
    text: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgSearchSourceRow> for SearchSource {
    type Error = WordloomError;

    fn try_from(r: PgSearchSourceRow) -> Result<Self> {
        let kind = SearchEntityKind::parse(&r.entity_type).ok_or_else(|| {
            WordloomError::InvalidInput(format!("unknown search entity '{}'", r.entity_type))
        })?;
        Ok(SearchSource {
            kind,
            entity_id: r.entity_id,
            text: r.text,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PgBookRow {
    id: Uuid,
    library_id: Uuid,
    bookshelf_id: Uuid,
    previous_bookshelf_id: Option<Uuid>,
    title: String,
    summary: Option<String>,
    soft_deleted_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<PgBookRow> for BookSnapshot {
    fn from(r: PgBookRow) -> Self {
        Self {
            id: r.id,
            library_id: r.library_id,
            bookshelf_id: r.bookshelf_id,
            previous_bookshelf_id: r.previous_bookshelf_id,
            title: r.title,
            summary: r.summary,
            soft_deleted_at: r.soft_deleted_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PgChronicleEventRow {
    id: Uuid,
    event_type: String,
    book_id: Option<Uuid>,
    block_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl From<PgChronicleEventRow> for ChronicleSourceEvent {
    fn from(r: PgChronicleEventRow) -> Self {
        Self {
            id: r.id,
            event_type: r.event_type,
            book_id: r.book_id,
            block_id: r.block_id,
            actor_id: r.actor_id,
            occurred_at: r.occurred_at,
            payload: r.payload,
        }
    }
}

const BOOK_COLUMNS: &str = "id, library_id, bookshelf_id, previous_bookshelf_id, title, summary, soft_deleted_at, updated_at";

/// Book row on an explicit connection; used inside bus transactions.
pub async fn load_book(conn: &mut PgConnection, book_id: Uuid) -> Result<Option<BookSnapshot>> {
    let row = sqlx::query_as::<_, PgBookRow>(&format!(
        "SELECT {BOOK_COLUMNS} FROM books WHERE id = $1"
    ))
    .bind(book_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(row.map(BookSnapshot::from))
}

pub struct PgSourceReader {
    pool: PgPool,
}

impl PgSourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceReader for PgSourceReader {
    async fn search_source(
        &self,
        kind: SearchEntityKind,
        entity_id: &str,
    ) -> Result<Option<SearchSource>> {
        let row = sqlx::query_as::<_, PgSearchSourceRow>(&format!(
            r#"
            SELECT entity_type, entity_id, text, updated_at
            FROM ({SEARCH_SOURCES}) s
            WHERE entity_type = $1 AND entity_id = $2
            "#
        ))
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(SearchSource::try_from).transpose()
    }

    async fn search_sources(&self, limit: Option<u32>) -> Result<Vec<SearchSource>> {
        let rows = sqlx::query_as::<_, PgSearchSourceRow>(&format!(
            r#"
            SELECT entity_type, entity_id, text, updated_at
            FROM ({SEARCH_SOURCES}) s
            ORDER BY entity_type, entity_id
            LIMIT $1
            "#
        ))
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(SearchSource::try_from).collect()
    }

    async fn book(&self, book_id: Uuid) -> Result<Option<BookSnapshot>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_book(&mut conn, book_id).await
    }

    async fn basement_books(&self, limit: Option<u32>) -> Result<Vec<BookSnapshot>> {
        let rows = sqlx::query_as::<_, PgBookRow>(&format!(
            r#"
            SELECT {BOOK_COLUMNS} FROM books
            WHERE soft_deleted_at IS NOT NULL
            ORDER BY id
            LIMIT $1
            "#
        ))
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(BookSnapshot::from).collect())
    }

    async fn chronicle_event(&self, id: Uuid) -> Result<Option<ChronicleSourceEvent>> {
        let row = sqlx::query_as::<_, PgChronicleEventRow>(
            r#"
            SELECT id, event_type, book_id, block_id, actor_id, occurred_at, payload
            FROM chronicle_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(ChronicleSourceEvent::from))
    }

    async fn chronicle_events(&self, limit: Option<u32>) -> Result<Vec<ChronicleSourceEvent>> {
        let rows = sqlx::query_as::<_, PgChronicleEventRow>(
            r#"
            SELECT id, event_type, book_id, block_id, actor_id, occurred_at, payload
            FROM chronicle_events
            ORDER BY occurred_at, id
            LIMIT $1
            "#,
        )
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ChronicleSourceEvent::from).collect())
    }
}
