//! Event bus transaction modes and the chronicle write path against a real
//! PostgreSQL database.
//!
//! Requires: DATABASE_URL with CREATE DATABASE rights.
//! Run with `cargo test --test pg_event_bus -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use wordloom::{OutboxMetrics, OutboxWorker, WorkerHealth, WorkerOptions};
use wordloom_core::aggregate::Book;
use wordloom_core::error::{Result, WordloomError};
use wordloom_core::events::{DomainEvent, EventKind, EventType};
use wordloom_core::outbox::{EnqueueRequest, OutboxStatus, Projection};
use wordloom_core::ports::{BasementStore, Clock, OutboxStore, SystemClock};
use wordloom_core::projector::ChronicleProjector;
use wordloom_harness::{drop_db, isolated_db, IsolatedDb};
use wordloom_postgres::bus::DispatchContext;
use wordloom_postgres::{
    default_handlers, enqueue_outbox, EventBus, EventHandler, HandlerRegistry, PgBasementStore,
    PgBookRepository, PgChronicleStore, PgOutboxStore, PgSourceReader, TxMode,
    CHRONICLE_ENTITY_TYPE,
};

async fn test_db() -> IsolatedDb {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for PG tests");
    isolated_db(&url).await.expect("failed to create isolated database")
}

/// Writes one search outbox row tagged with its own name.
struct Marker(&'static str);

#[async_trait]
impl EventHandler for Marker {
    fn name(&self) -> &'static str {
        self.0
    }

    fn handles(&self) -> Vec<EventType> {
        vec![EventType::TagCreated]
    }

    async fn handle(
        &self,
        conn: &mut PgConnection,
        event: &DomainEvent,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        enqueue_outbox(conn, Projection::Search, EnqueueRequest::upsert(self.0, event.event_id))
            .await?;
        Ok(())
    }
}

/// Writes a row, then rejects the event.
struct Rejecting;

#[async_trait]
impl EventHandler for Rejecting {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn handles(&self) -> Vec<EventType> {
        vec![EventType::TagCreated]
    }

    async fn handle(
        &self,
        conn: &mut PgConnection,
        event: &DomainEvent,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        enqueue_outbox(
            conn,
            Projection::Search,
            EnqueueRequest::upsert("rejecting", event.event_id),
        )
        .await?;
        Err(WordloomError::InvalidInput("handler rejected event".into()))
    }
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(Arc::new(Marker("first")))
        .register(Arc::new(Rejecting))
        .register(Arc::new(Marker("last")))
}

fn tag_created() -> DomainEvent {
    DomainEvent::new(EventKind::TagCreated {
        tag_id: Uuid::new_v4(),
        name: "physics".into(),
    })
}

async fn count(pool: &PgPool, sql: &str, bind: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql).bind(bind).fetch_one(pool).await.unwrap();
    n
}

async fn search_rows(pool: &PgPool, entity_type: &str) -> i64 {
    count(
        pool,
        "SELECT count(*) FROM search_outbox_events WHERE entity_type = $1",
        entity_type,
    )
    .await
}

#[tokio::test]
#[ignore]
async fn test_savepoint_mode_keeps_other_handlers_writes() {
    let db = test_db().await;
    let bus = EventBus::bootstrap(db.pool.clone(), registry(), TxMode::Savepoint);

    let report = bus.publish(&[tag_created()], None).await.unwrap();

    assert_eq!(report.failures(), 1);
    assert_eq!(report.events[0].results.len(), 3);
    assert_eq!(search_rows(&db.pool, "first").await, 1);
    assert_eq!(search_rows(&db.pool, "rejecting").await, 0);
    assert_eq!(search_rows(&db.pool, "last").await, 1);
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_atomic_mode_rolls_back_the_event_and_returns_the_error() {
    let db = test_db().await;
    let bus = EventBus::bootstrap(db.pool.clone(), registry(), TxMode::Atomic);

    let err = bus.publish(&[tag_created()], None).await.unwrap_err();

    assert!(err.to_string().contains("handler rejected event"));
    assert_eq!(search_rows(&db.pool, "first").await, 0);
    assert_eq!(search_rows(&db.pool, "rejecting").await, 0);
    assert_eq!(search_rows(&db.pool, "last").await, 0);
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_chronicle_record_survives_an_unavailable_bus() {
    let db = test_db().await;
    let closed = PgPoolOptions::new().connect_lazy_with((*db.pool.connect_options()).clone());
    closed.close().await;
    let bus = Arc::new(EventBus::bootstrap(closed, default_handlers(), TxMode::Savepoint));
    let repo = PgBookRepository::new(db.pool.clone()).with_bus(bus);

    let mut book = Book::create(Uuid::new_v4(), Uuid::new_v4(), "quantum entanglement");
    let events = repo.save(&mut book, None).await.unwrap();
    assert_eq!(events.len(), 1);

    let id = book.id.to_string();
    assert_eq!(count(&db.pool, "SELECT count(*) FROM books WHERE id::text = $1", &id).await, 1);
    assert_eq!(search_rows(&db.pool, "book").await, 1);
    let event_id = events[0].event_id.to_string();
    assert_eq!(
        count(&db.pool, "SELECT count(*) FROM chronicle_events WHERE id::text = $1", &event_id).await,
        1
    );
    assert_eq!(
        count(
            &db.pool,
            "SELECT count(*) FROM chronicle_outbox_events WHERE entity_id = $1",
            &event_id
        )
        .await,
        1
    );
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_book_lifecycle_reaches_chronicle_and_basement() {
    let db = test_db().await;
    let bus = Arc::new(EventBus::bootstrap(
        db.pool.clone(),
        default_handlers(),
        TxMode::Savepoint,
    ));
    let repo = PgBookRepository::new(db.pool.clone()).with_bus(bus);

    let mut book = Book::create(Uuid::new_v4(), Uuid::new_v4(), "quantum entanglement");
    repo.save(&mut book, None).await.unwrap();
    book.move_to_basement(Uuid::new_v4()).unwrap();
    repo.save(&mut book, None).await.unwrap();

    // basement is projected by the bus right after commit
    let basement = PgBasementStore::new(db.pool.clone());
    let entry = basement.get(book.id).await.unwrap().expect("basement entry");
    assert_eq!(entry.title_snapshot, "quantum entanglement");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let outbox = Arc::new(PgOutboxStore::new(db.pool.clone(), Projection::Chronicle).unwrap());
    let store = Arc::new(PgChronicleStore::new(db.pool.clone()));
    let worker = OutboxWorker::new(
        outbox.clone(),
        Arc::new(ChronicleProjector::new(
            store.clone(),
            Arc::new(PgSourceReader::new(db.pool.clone())),
            clock.clone(),
        )),
        WorkerOptions {
            worker_id: "w-chronicle".into(),
            ..Default::default()
        },
        Arc::new(OutboxMetrics::new(Projection::Chronicle)),
        Arc::new(WorkerHealth::new(
            Projection::Chronicle,
            "w-chronicle",
            Duration::from_secs(60),
        )),
        clock,
    );
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.done, 2);
    let backlog = outbox.backlog(Duration::from_secs(30)).await.unwrap();
    assert_eq!(backlog.lag_events, 0);

    let timeline = store.for_book(book.id, 10).await.unwrap();
    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0].summary, "Book created: quantum entanglement");
    assert_eq!(
        timeline[1].summary,
        "Book moved to basement: quantum entanglement"
    );
    for entry in &timeline {
        assert_eq!(entry.payload["provenance"], "live");
        let row = outbox.get(entry.id).await.unwrap().unwrap();
        assert_eq!(row.entity_type, CHRONICLE_ENTITY_TYPE);
        assert_eq!(row.status, OutboxStatus::Done);
    }
    drop_db(db).await;
}
