//! Chronicle recording on the write path.
//!
//! Every domain event is appended to `chronicle_events` and gets a chronicle
//! outbox row, both on the aggregate's own transaction. If the aggregate
//! write rolls back, so does its chronicle record; once it commits, the
//! outbox row is there for the chronicle worker and for replay.

use sqlx::PgConnection;
use uuid::Uuid;

use wordloom_core::error::Result;
use wordloom_core::events::DomainEvent;
use wordloom_core::outbox::{next_event_version, EnqueueRequest, Projection};
use wordloom_core::source::ChronicleSourceEvent;
use wordloom_core::trace::TraceContext;

use crate::error::db_err;
use crate::outbox::OutboxBatch;

pub const CHRONICLE_ENTITY_TYPE: &str = "chronicle_event";

/// Record one event. The outbox row id is the event id, so recording the
/// same event twice is a no-op.
pub async fn record_chronicle(
    conn: &mut PgConnection,
    batch: &mut OutboxBatch,
    event: &DomainEvent,
    trace: Option<&TraceContext>,
) -> Result<Uuid> {
    let record = ChronicleSourceEvent::from_domain(event);
    sqlx::query(
        r#"
        INSERT INTO chronicle_events (
            id, event_type, book_id, block_id, actor_id, occurred_at, payload
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(&record.event_type)
    .bind(record.book_id)
    .bind(record.block_id)
    .bind(record.actor_id)
    .bind(record.occurred_at)
    .bind(&record.payload)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    let request = EnqueueRequest::upsert(CHRONICLE_ENTITY_TYPE, record.id)
        .with_id(record.id)
        .with_version(next_event_version())
        .with_payload(serde_json::to_value(&record).map_err(anyhow::Error::from)?)
        .with_event_type(record.event_type.clone())
        .with_trace(trace.map(TraceContext::child));
    batch.enqueue(conn, Projection::Chronicle, request).await
}

/// Record every buffered event of an aggregate, in order.
pub async fn record_all(
    conn: &mut PgConnection,
    batch: &mut OutboxBatch,
    events: &[DomainEvent],
    trace: Option<&TraceContext>,
) -> Result<()> {
    for event in events {
        record_chronicle(conn, batch, event, trace).await?;
    }
    Ok(())
}
