//! Outbox tables: the transactional writer and the worker-facing store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use wordloom_core::error::{Result, WordloomError};
use wordloom_core::outbox::{
    BacklogStats, EnqueueRequest, OutboxOp, OutboxRow, OutboxStatus, Projection, ReplayAudit,
    ReplayFilter, ReplayOutcome, RowFailure,
};
use wordloom_core::ports::OutboxStore;

use crate::error::db_err;

fn table_for(projection: Projection) -> Result<&'static str> {
    projection.outbox_table().ok_or_else(|| {
        WordloomError::InvalidInput(format!("projection '{projection}' has no outbox table"))
    })
}

// ── Row mapping ───────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgOutboxRow {
    id: Uuid,
    entity_type: String,
    entity_id: String,
    op: String,
    event_version: i64,
    payload: Option<serde_json::Value>,
    status: String,
    owner: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    processing_started_at: Option<DateTime<Utc>>,
    attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_reason: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    replay_count: i32,
    last_replayed_at: Option<DateTime<Utc>>,
    last_replayed_by: Option<String>,
    last_replayed_reason: Option<String>,
    traceparent: Option<String>,
    tracestate: Option<String>,
}

impl TryFrom<PgOutboxRow> for OutboxRow {
    type Error = WordloomError;

    fn try_from(r: PgOutboxRow) -> Result<Self> {
        let op = OutboxOp::parse(&r.op)
            .ok_or_else(|| WordloomError::InvalidInput(format!("unknown outbox op '{}'", r.op)))?;
        let status = OutboxStatus::parse(&r.status).ok_or_else(|| {
            WordloomError::InvalidInput(format!("unknown outbox status '{}'", r.status))
        })?;
        Ok(OutboxRow {
            id: r.id,
            entity_type: r.entity_type,
            entity_id: r.entity_id,
            op,
            event_version: r.event_version,
            payload: r.payload,
            status,
            owner: r.owner,
            lease_until: r.lease_until,
            processing_started_at: r.processing_started_at,
            attempts: r.attempts,
            next_retry_at: r.next_retry_at,
            error_reason: r.error_reason,
            error: r.error,
            created_at: r.created_at,
            updated_at: r.updated_at,
            processed_at: r.processed_at,
            replay_count: r.replay_count,
            last_replayed_at: r.last_replayed_at,
            last_replayed_by: r.last_replayed_by,
            last_replayed_reason: r.last_replayed_reason,
            traceparent: r.traceparent,
            tracestate: r.tracestate,
        })
    }
}

// ── Writer ────────────────────────────────────────────────────

/// Insert one `pending` row on the caller's connection (normally inside the
/// aggregate's transaction). Re-enqueueing an existing id is a no-op.
pub async fn enqueue_outbox(
    conn: &mut PgConnection,
    projection: Projection,
    request: EnqueueRequest,
) -> Result<Uuid> {
    request.validate()?;
    let table = table_for(projection)?;
    let row = request.into_row(Utc::now());
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (
            id, entity_type, entity_id, op, event_version, payload,
            status, attempts, replay_count, traceparent, tracestate,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, 0, $7, $8, now(), now())
        ON CONFLICT (id) DO NOTHING
        "#
    ))
    .bind(row.id)
    .bind(&row.entity_type)
    .bind(&row.entity_id)
    .bind(row.op.as_str())
    .bind(row.event_version)
    .bind(&row.payload)
    .bind(&row.traceparent)
    .bind(&row.tracestate)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    debug!(
        projection = projection.as_str(),
        id = %row.id,
        entity_type = %row.entity_type,
        entity_id = %row.entity_id,
        op = row.op.as_str(),
        event_version = row.event_version,
        "outbox row enqueued"
    );
    Ok(row.id)
}

/// Rows enqueued in one transaction. `committed()` is called after the
/// transaction commits and bumps `outbox_produced_total`.
#[derive(Debug, Default)]
pub struct OutboxBatch {
    produced: Vec<(String, String)>,
}

impl OutboxBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(
        &mut self,
        conn: &mut PgConnection,
        projection: Projection,
        request: EnqueueRequest,
    ) -> Result<Uuid> {
        let labels = (
            request.event_type_label().to_string(),
            request.entity_type.clone(),
        );
        let id = enqueue_outbox(conn, projection, request).await?;
        self.produced.push(labels);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.produced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.produced.is_empty()
    }

    pub fn committed(self) {
        for (event_type, entity_type) in self.produced {
            metrics::counter!(
                "outbox_produced_total",
                "event_type" => event_type,
                "entity_type" => entity_type
            )
            .increment(1);
        }
    }
}

// ── PgOutboxStore ─────────────────────────────────────────────

pub struct PgOutboxStore {
    pool: PgPool,
    projection: Projection,
    table: &'static str,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, projection: Projection) -> Result<Self> {
        let table = table_for(projection)?;
        Ok(Self {
            pool,
            projection,
            table,
        })
    }

    /// All rows, oldest version first. Used by ops tooling and tests.
    pub async fn list(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, PgOutboxRow>(&format!(
            r#"
            SELECT * FROM {}
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY event_version, created_at
            "#,
            self.table
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(OutboxRow::try_from).collect()
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    fn projection(&self) -> Projection {
        self.projection
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let mut batch = OutboxBatch::new();
        let id = batch.enqueue(&mut conn, self.projection, request).await?;
        batch.committed();
        Ok(id)
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending',
                owner = NULL,
                lease_until = NULL,
                processing_started_at = NULL,
                updated_at = now()
            WHERE status = 'processing'
              AND lease_until < now()
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn claim_batch(
        &self,
        owner: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxRow>> {
        // Atomic claim using CTE + FOR UPDATE SKIP LOCKED; status flips in the
        // same statement so competing workers never see the row as pending.
        let rows = sqlx::query_as::<_, PgOutboxRow>(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY event_version ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} o
            SET status = 'processing',
                owner = $1,
                processing_started_at = now(),
                lease_until = now() + make_interval(secs => $3),
                updated_at = now()
            FROM claimable c
            WHERE o.id = c.id
            RETURNING o.*
            "#,
            table = self.table
        ))
        .bind(owner)
        .bind(i64::from(limit))
        .bind(lease_ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut claimed = rows
            .into_iter()
            .map(OutboxRow::try_from)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| {
            (a.event_version, a.created_at).cmp(&(b.event_version, b.created_at))
        });
        Ok(claimed)
    }

    async fn mark_done(&self, id: Uuid, owner: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'done',
                processed_at = now(),
                owner = NULL,
                lease_until = NULL,
                processing_started_at = NULL,
                next_retry_at = NULL,
                updated_at = now()
            WHERE id = $1 AND owner = $2 AND status = 'processing'
            "#,
            self.table
        ))
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        owner: &str,
        delay: Duration,
        failure: &RowFailure,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending',
                attempts = attempts + 1,
                next_retry_at = now() + make_interval(secs => $3),
                error_reason = $4,
                error = $5,
                owner = NULL,
                lease_until = NULL,
                processing_started_at = NULL,
                updated_at = now()
            WHERE id = $1 AND owner = $2 AND status = 'processing'
            "#,
            self.table
        ))
        .bind(id)
        .bind(owner)
        .bind(delay.as_secs_f64())
        .bind(failure.reason.as_str())
        .bind(&failure.message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: Uuid, owner: &str, failure: &RowFailure) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'failed',
                attempts = attempts + 1,
                error_reason = $3,
                error = $4,
                processed_at = now(),
                owner = NULL,
                lease_until = NULL,
                processing_started_at = NULL,
                next_retry_at = NULL,
                updated_at = now()
            WHERE id = $1 AND owner = $2 AND status = 'processing'
            "#,
            self.table
        ))
        .bind(id)
        .bind(owner)
        .bind(failure.reason.as_str())
        .bind(&failure.message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn backlog(&self, stuck_after: Duration) -> Result<BacklogStats> {
        let (lag, oldest, inflight, stuck) = sqlx::query_as::<_, (i64, f64, i64, i64)>(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status IN ('pending', 'processing')),
                COALESCE(EXTRACT(EPOCH FROM now() - MIN(created_at)
                    FILTER (WHERE status IN ('pending', 'processing')))::float8, 0),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (
                    WHERE status = 'processing'
                      AND (lease_until < now()
                           OR processing_started_at < now() - make_interval(secs => $1))
                )
            FROM {}
            "#,
            self.table
        ))
        .bind(stuck_after.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(BacklogStats {
            lag_events: lag,
            oldest_age_seconds: oldest.max(0.0),
            inflight_events: inflight,
            stuck_events: stuck,
        })
    }

    async fn replay_failed(
        &self,
        filter: &ReplayFilter,
        audit: &ReplayAudit,
        dry_run: bool,
    ) -> Result<ReplayOutcome> {
        let ids: Option<Vec<Uuid>> = (!filter.ids.is_empty()).then(|| filter.ids.clone());
        let since_hours = filter.since_hours.map(f64::from);
        let limit = filter.limit.map(i64::from);

        if dry_run {
            let matched: i64 = sqlx::query_scalar(&format!(
                r#"
                SELECT COUNT(*) FROM (
                    SELECT id FROM {}
                    WHERE status = 'failed'
                      AND ($1::text IS NULL OR entity_type = $1)
                      AND ($2::float8 IS NULL OR updated_at >= now() - make_interval(hours => 1) * $2)
                      AND ($3::uuid[] IS NULL OR id = ANY($3))
                    LIMIT $4
                ) m
                "#,
                self.table
            ))
            .bind(&filter.entity_type)
            .bind(since_hours)
            .bind(&ids)
            .bind(limit)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            return Ok(ReplayOutcome {
                matched: matched.max(0) as u64,
                replayed: Vec::new(),
                dry_run: true,
            });
        }

        let replayed: Vec<Uuid> = sqlx::query_scalar(&format!(
            r#"
            WITH picked AS (
                SELECT id FROM {table}
                WHERE status = 'failed'
                  AND ($1::text IS NULL OR entity_type = $1)
                  AND ($2::float8 IS NULL OR updated_at >= now() - make_interval(hours => 1) * $2)
                  AND ($3::uuid[] IS NULL OR id = ANY($3))
                ORDER BY event_version, created_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} o
            SET status = 'pending',
                attempts = 0,
                owner = NULL,
                lease_until = NULL,
                processing_started_at = NULL,
                next_retry_at = NULL,
                error_reason = NULL,
                error = NULL,
                processed_at = NULL,
                replay_count = o.replay_count + 1,
                last_replayed_at = now(),
                last_replayed_by = $5,
                last_replayed_reason = $6,
                updated_at = now()
            FROM picked p
            WHERE o.id = p.id
            RETURNING o.id
            "#,
            table = self.table
        ))
        .bind(&filter.entity_type)
        .bind(since_hours)
        .bind(&ids)
        .bind(limit)
        .bind(&audit.by)
        .bind(&audit.reason)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ReplayOutcome {
            matched: replayed.len() as u64,
            replayed,
            dry_run: false,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRow>> {
        let row = sqlx::query_as::<_, PgOutboxRow>(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(OutboxRow::try_from).transpose()
    }
}
