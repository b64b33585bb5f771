//! Version-guarded read-model tables.
//!
//! Every upsert carries `WHERE excluded.version >= stored.version` and every
//! delete `AND version <= $n`, so stale or repeated writes affect zero rows and
//! surface as [`WriteOutcome::Noop`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use wordloom_core::error::Result;
use wordloom_core::ports::{BasementStore, ChronicleStore, ProjectionStatusStore, SearchIndexStore};
use wordloom_core::read_model::{
    BasementEntry, ChronicleEntry, ProjectionStatus, SearchDocument, WriteOutcome,
};

use crate::error::db_err;

// ── search_index ──────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgSearchRow {
    entity_type: String,
    entity_id: String,
    text: String,
    snippet: String,
    rank_score: f64,
    event_version: i64,
    updated_at: DateTime<Utc>,
}

impl From<PgSearchRow> for SearchDocument {
    fn from(r: PgSearchRow) -> Self {
        Self {
            entity_type: r.entity_type,
            entity_id: r.entity_id,
            text: r.text,
            snippet: r.snippet,
            rank_score: r.rank_score,
            event_version: r.event_version,
            updated_at: r.updated_at,
        }
    }
}

pub struct PgSearchIndexStore {
    pool: PgPool,
}

impl PgSearchIndexStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ranked full-text lookup over `to_tsvector('simple', text)`.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchDocument>> {
        let rows = sqlx::query_as::<_, PgSearchRow>(
            r#"
            SELECT entity_type, entity_id, text, snippet, rank_score, event_version, updated_at
            FROM search_index
            WHERE to_tsvector('simple', text) @@ plainto_tsquery('simple', $1)
            ORDER BY rank_score DESC, entity_type, entity_id
            LIMIT $2
            "#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }
}

#[async_trait]
impl SearchIndexStore for PgSearchIndexStore {
    async fn upsert(&self, doc: &SearchDocument) -> Result<WriteOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO search_index (
                entity_type, entity_id, text, snippet, rank_score, event_version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entity_type, entity_id) DO UPDATE
            SET text = EXCLUDED.text,
                snippet = EXCLUDED.snippet,
                rank_score = EXCLUDED.rank_score,
                updated_at = CASE
                    WHEN EXCLUDED.event_version > search_index.event_version
                        THEN EXCLUDED.updated_at
                    ELSE search_index.updated_at
                END,
                event_version = EXCLUDED.event_version
            WHERE EXCLUDED.event_version >= search_index.event_version
            "#,
        )
        .bind(&doc.entity_type)
        .bind(&doc.entity_id)
        .bind(&doc.text)
        .bind(&doc.snippet)
        .bind(doc.rank_score)
        .bind(doc.event_version)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        event_version: i64,
    ) -> Result<WriteOutcome> {
        let result = sqlx::query(
            r#"
            DELETE FROM search_index
            WHERE entity_type = $1 AND entity_id = $2 AND event_version <= $3
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(event_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<SearchDocument>> {
        let row = sqlx::query_as::<_, PgSearchRow>(
            r#"
            SELECT entity_type, entity_id, text, snippet, rank_score, event_version, updated_at
            FROM search_index
            WHERE entity_type = $1 AND entity_id = $2
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(SearchDocument::from))
    }

    async fn list(&self) -> Result<Vec<SearchDocument>> {
        let rows = sqlx::query_as::<_, PgSearchRow>(
            r#"
            SELECT entity_type, entity_id, text, snippet, rank_score, event_version, updated_at
            FROM search_index
            ORDER BY entity_type, entity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }

    async fn truncate(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_index")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ── chronicle_entries ─────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgChronicleRow {
    id: Uuid,
    event_type: String,
    book_id: Option<Uuid>,
    block_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
    summary: String,
    projection_version: i64,
    updated_at: DateTime<Utc>,
}

impl From<PgChronicleRow> for ChronicleEntry {
    fn from(r: PgChronicleRow) -> Self {
        Self {
            id: r.id,
            event_type: r.event_type,
            book_id: r.book_id,
            block_id: r.block_id,
            actor_id: r.actor_id,
            occurred_at: r.occurred_at,
            created_at: r.created_at,
            payload: r.payload,
            summary: r.summary,
            projection_version: r.projection_version,
            updated_at: r.updated_at,
        }
    }
}

pub struct PgChronicleStore {
    pool: PgPool,
}

impl PgChronicleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Timeline for one book, oldest first.
    pub async fn for_book(&self, book_id: Uuid, limit: i64) -> Result<Vec<ChronicleEntry>> {
        let rows = sqlx::query_as::<_, PgChronicleRow>(
            r#"
            SELECT * FROM chronicle_entries
            WHERE book_id = $1
            ORDER BY occurred_at, id
            LIMIT $2
            "#,
        )
        .bind(book_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ChronicleEntry::from).collect())
    }
}

#[async_trait]
impl ChronicleStore for PgChronicleStore {
    async fn upsert(&self, entry: &ChronicleEntry) -> Result<WriteOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO chronicle_entries (
                id, event_type, book_id, block_id, actor_id, occurred_at, created_at,
                payload, summary, projection_version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET event_type = EXCLUDED.event_type,
                book_id = EXCLUDED.book_id,
                block_id = EXCLUDED.block_id,
                actor_id = EXCLUDED.actor_id,
                occurred_at = EXCLUDED.occurred_at,
                payload = EXCLUDED.payload,
                summary = EXCLUDED.summary,
                updated_at = CASE
                    WHEN EXCLUDED.projection_version > chronicle_entries.projection_version
                        THEN EXCLUDED.updated_at
                    ELSE chronicle_entries.updated_at
                END,
                projection_version = EXCLUDED.projection_version
            WHERE EXCLUDED.projection_version >= chronicle_entries.projection_version
            "#,
        )
        .bind(entry.id)
        .bind(&entry.event_type)
        .bind(entry.book_id)
        .bind(entry.block_id)
        .bind(entry.actor_id)
        .bind(entry.occurred_at)
        .bind(entry.created_at)
        .bind(&entry.payload)
        .bind(&entry.summary)
        .bind(entry.projection_version)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn delete(&self, id: Uuid, projection_version: i64) -> Result<WriteOutcome> {
        let result = sqlx::query(
            "DELETE FROM chronicle_entries WHERE id = $1 AND projection_version <= $2",
        )
        .bind(id)
        .bind(projection_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChronicleEntry>> {
        let row = sqlx::query_as::<_, PgChronicleRow>("SELECT * FROM chronicle_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(ChronicleEntry::from))
    }

    async fn list(&self) -> Result<Vec<ChronicleEntry>> {
        let rows = sqlx::query_as::<_, PgChronicleRow>(
            "SELECT * FROM chronicle_entries ORDER BY occurred_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ChronicleEntry::from).collect())
    }

    async fn truncate(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chronicle_entries")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ── basement_entries ──────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgBasementRow {
    id: Uuid,
    book_id: Uuid,
    library_id: Uuid,
    bookshelf_id: Uuid,
    previous_bookshelf_id: Option<Uuid>,
    title_snapshot: String,
    summary_snapshot: Option<String>,
    event_version: i64,
    moved_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PgBasementRow> for BasementEntry {
    fn from(r: PgBasementRow) -> Self {
        Self {
            id: r.id,
            book_id: r.book_id,
            library_id: r.library_id,
            bookshelf_id: r.bookshelf_id,
            previous_bookshelf_id: r.previous_bookshelf_id,
            title_snapshot: r.title_snapshot,
            summary_snapshot: r.summary_snapshot,
            event_version: r.event_version,
            moved_at: r.moved_at,
            updated_at: r.updated_at,
        }
    }
}

/// Basement upsert on an explicit connection; shared by the store and the
/// in-transaction bus handler.
pub async fn upsert_basement(conn: &mut PgConnection, entry: &BasementEntry) -> Result<WriteOutcome> {
    let result = sqlx::query(
        r#"
        INSERT INTO basement_entries (
            id, book_id, library_id, bookshelf_id, previous_bookshelf_id,
            title_snapshot, summary_snapshot, event_version, moved_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (book_id) DO UPDATE
        SET library_id = EXCLUDED.library_id,
            bookshelf_id = EXCLUDED.bookshelf_id,
            previous_bookshelf_id = EXCLUDED.previous_bookshelf_id,
            title_snapshot = EXCLUDED.title_snapshot,
            summary_snapshot = EXCLUDED.summary_snapshot,
            moved_at = EXCLUDED.moved_at,
            updated_at = CASE
                WHEN EXCLUDED.event_version > basement_entries.event_version
                    THEN EXCLUDED.updated_at
                ELSE basement_entries.updated_at
            END,
            event_version = EXCLUDED.event_version
        WHERE EXCLUDED.event_version >= basement_entries.event_version
        "#,
    )
    .bind(entry.id)
    .bind(entry.book_id)
    .bind(entry.library_id)
    .bind(entry.bookshelf_id)
    .bind(entry.previous_bookshelf_id)
    .bind(&entry.title_snapshot)
    .bind(&entry.summary_snapshot)
    .bind(entry.event_version)
    .bind(entry.moved_at)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
}

pub async fn remove_basement(
    conn: &mut PgConnection,
    book_id: Uuid,
    event_version: i64,
) -> Result<WriteOutcome> {
    let result =
        sqlx::query("DELETE FROM basement_entries WHERE book_id = $1 AND event_version <= $2")
            .bind(book_id)
            .bind(event_version)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    Ok(WriteOutcome::from_rows_affected(result.rows_affected()))
}

pub struct PgBasementStore {
    pool: PgPool,
}

impl PgBasementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BasementStore for PgBasementStore {
    async fn upsert(&self, entry: &BasementEntry) -> Result<WriteOutcome> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        upsert_basement(&mut conn, entry).await
    }

    async fn remove(&self, book_id: Uuid, event_version: i64) -> Result<WriteOutcome> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        remove_basement(&mut conn, book_id, event_version).await
    }

    async fn get(&self, book_id: Uuid) -> Result<Option<BasementEntry>> {
        let row = sqlx::query_as::<_, PgBasementRow>(
            "SELECT * FROM basement_entries WHERE book_id = $1",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(BasementEntry::from))
    }

    async fn list(&self) -> Result<Vec<BasementEntry>> {
        let rows = sqlx::query_as::<_, PgBasementRow>(
            "SELECT * FROM basement_entries ORDER BY book_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(BasementEntry::from).collect())
    }

    async fn truncate(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM basement_entries")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ── projection_status ─────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgStatusRow {
    projection_name: String,
    last_rebuild_started_at: Option<DateTime<Utc>>,
    last_rebuild_finished_at: Option<DateTime<Utc>>,
    last_rebuild_duration_seconds: Option<f64>,
    last_rebuild_success: Option<bool>,
    last_rebuild_error: Option<String>,
    rows_written: i64,
}

pub struct PgProjectionStatusStore {
    pool: PgPool,
}

impl PgProjectionStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionStatusStore for PgProjectionStatusStore {
    async fn record(&self, status: &ProjectionStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_status (
                projection_name, last_rebuild_started_at, last_rebuild_finished_at,
                last_rebuild_duration_seconds, last_rebuild_success, last_rebuild_error,
                rows_written, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (projection_name) DO UPDATE
            SET last_rebuild_started_at = EXCLUDED.last_rebuild_started_at,
                last_rebuild_finished_at = EXCLUDED.last_rebuild_finished_at,
                last_rebuild_duration_seconds = EXCLUDED.last_rebuild_duration_seconds,
                last_rebuild_success = EXCLUDED.last_rebuild_success,
                last_rebuild_error = EXCLUDED.last_rebuild_error,
                rows_written = EXCLUDED.rows_written,
                updated_at = now()
            "#,
        )
        .bind(&status.projection_name)
        .bind(status.last_rebuild_started_at)
        .bind(status.last_rebuild_finished_at)
        .bind(status.last_rebuild_duration_seconds)
        .bind(status.last_rebuild_success)
        .bind(&status.last_rebuild_error)
        .bind(status.rows_written)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, projection_name: &str) -> Result<Option<ProjectionStatus>> {
        let row = sqlx::query_as::<_, PgStatusRow>(
            r#"
            SELECT projection_name, last_rebuild_started_at, last_rebuild_finished_at,
                   last_rebuild_duration_seconds, last_rebuild_success, last_rebuild_error,
                   rows_written
            FROM projection_status
            WHERE projection_name = $1
            "#,
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| ProjectionStatus {
            projection_name: r.projection_name,
            last_rebuild_started_at: r.last_rebuild_started_at,
            last_rebuild_finished_at: r.last_rebuild_finished_at,
            last_rebuild_duration_seconds: r.last_rebuild_duration_seconds,
            last_rebuild_success: r.last_rebuild_success,
            last_rebuild_error: r.last_rebuild_error,
            rows_written: r.rows_written,
        }))
    }
}
