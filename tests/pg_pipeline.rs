//! Pipeline scenarios against a real PostgreSQL database.
//!
//! Each test creates a throwaway database from `migrations/`.
//!
//! Requires: DATABASE_URL with CREATE DATABASE rights.
//! Run with `cargo test --test pg_pipeline -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use wordloom::{
    replay_failed, CycleReport, FaultConfig, FaultInjectingSink, OutboxMetrics, OutboxWorker,
    RebuildMode, RebuildOptions, Rebuilder, WorkerHealth, WorkerOptions,
};
use wordloom_core::error::ErrorReason;
use wordloom_core::outbox::{EnqueueRequest, OutboxStatus, Projection, ReplayAudit, ReplayFilter};
use wordloom_core::ports::{
    verify_environment, Clock, OutboxStore, ProjectionStatusStore, SearchIndexStore, SystemClock,
};
use wordloom_core::projector::{Projector, SearchProjector};
use wordloom_core::read_model::SearchDocument;
use wordloom_core::retry::RetryPolicy;
use wordloom_harness::{drop_db, isolated_db, IsolatedDb, RecordingSink};
use wordloom_postgres::{
    PgOutboxStore, PgProjectionStatusStore, PgSearchIndexStore, PgSentinelStore, PgSourceReader,
};

async fn test_db() -> IsolatedDb {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for PG tests");
    isolated_db(&url).await.expect("failed to create isolated database")
}

struct PgPipeline {
    outbox: Arc<PgOutboxStore>,
    index: Arc<PgSearchIndexStore>,
    source: Arc<PgSourceReader>,
    status: Arc<PgProjectionStatusStore>,
    sink: Arc<RecordingSink>,
    clock: Arc<dyn Clock>,
}

impl PgPipeline {
    fn new(db: &IsolatedDb) -> Self {
        Self {
            outbox: Arc::new(PgOutboxStore::new(db.pool.clone(), Projection::Search).unwrap()),
            index: Arc::new(PgSearchIndexStore::new(db.pool.clone())),
            source: Arc::new(PgSourceReader::new(db.pool.clone())),
            status: Arc::new(PgProjectionStatusStore::new(db.pool.clone())),
            sink: Arc::new(RecordingSink::new()),
            clock: Arc::new(SystemClock),
        }
    }

    fn projector(&self, faults: FaultConfig) -> Arc<dyn Projector> {
        Arc::new(SearchProjector::new(
            self.index.clone(),
            self.source.clone(),
            FaultInjectingSink::wrap(self.sink.clone(), faults),
            self.clock.clone(),
        ))
    }

    fn worker(&self, worker_id: &str, faults: FaultConfig) -> OutboxWorker {
        let options = WorkerOptions {
            worker_id: worker_id.to_string(),
            retry: RetryPolicy {
                base: Duration::from_millis(50),
                cap: Duration::from_millis(200),
                max_attempts: 8,
            },
            ..Default::default()
        };
        OutboxWorker::new(
            self.outbox.clone(),
            self.projector(faults),
            options,
            Arc::new(OutboxMetrics::new(Projection::Search)),
            Arc::new(WorkerHealth::new(Projection::Search, worker_id, Duration::from_secs(60))),
            self.clock.clone(),
        )
    }

    /// Cycle until the backlog is empty, sleeping past retry delays.
    async fn drain(&self, worker: &OutboxWorker) -> CycleReport {
        let mut total = CycleReport::default();
        for _ in 0..40 {
            let report = worker.run_once().await.unwrap();
            total.done += report.done;
            total.noops += report.noops;
            total.retried += report.retried;
            total.failed += report.failed;
            let backlog = self.outbox.backlog(Duration::from_secs(30)).await.unwrap();
            if backlog.lag_events == 0 {
                return total;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("outbox did not drain");
    }

    async fn snapshot(&self) -> Vec<SearchDocument> {
        let mut docs = self.index.list().await.unwrap();
        docs.sort_by(|a, b| (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id)));
        docs
    }
}

#[tokio::test]
#[ignore]
async fn test_sentinel_guards_environment() {
    let db = test_db().await;
    let sentinel = PgSentinelStore::new(db.pool.clone());
    verify_environment(&sentinel, "test").await.unwrap();
    assert!(verify_environment(&sentinel, "prod").await.is_err());
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_happy_path_upsert() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    let id = p
        .outbox
        .enqueue(
            EnqueueRequest::upsert("book", Uuid::new_v4())
                .with_version(1_000)
                .with_payload(json!({ "text": "quantum entanglement" })),
        )
        .await
        .unwrap();

    let worker = p.worker("w-1", FaultConfig::default());
    p.drain(&worker).await;

    let docs = p.snapshot().await;
    assert_eq!(docs.len(), 1);
    assert!(docs[0].text.contains("quantum entanglement"));
    assert_eq!(docs[0].event_version, 1_000);
    let row = p.outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Done);
    assert_eq!(row.attempts, 0);
    assert!(row.processed_at.is_some());
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_out_of_order_delivery() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    let worker = p.worker("w-1", FaultConfig::default());

    p.outbox
        .enqueue(EnqueueRequest::upsert("block", "blk-1").with_version(200).with_payload(json!({ "text": "v2" })))
        .await
        .unwrap();
    p.drain(&worker).await;
    p.outbox
        .enqueue(EnqueueRequest::upsert("block", "blk-1").with_version(100).with_payload(json!({ "text": "v1" })))
        .await
        .unwrap();
    let report = p.drain(&worker).await;

    assert_eq!(report.noops, 1);
    let doc = p.index.get("block", "blk-1").await.unwrap().unwrap();
    assert_eq!(doc.text, "v2");
    assert_eq!(worker.metrics().count("outbox_idempotent_noop_total"), 1);
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_transient_429_on_deletes() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    let faults = FaultConfig {
        es_429_every_n: Some(2),
        ops: Some(vec!["delete".into()]),
        ..Default::default()
    };
    let worker = p.worker("w-1", faults);

    let mut ids = Vec::new();
    for i in 0..10i64 {
        ids.push(
            p.outbox
                .enqueue(EnqueueRequest::delete("block", format!("blk-{i}")).with_version(100 + i))
                .await
                .unwrap(),
        );
    }
    p.drain(&worker).await;

    let mut injected = 0;
    for id in &ids {
        let row = p.outbox.get(*id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Done);
        if row.attempts >= 1 {
            injected += 1;
            assert_eq!(row.error_reason(), Some(ErrorReason::Downstream429));
        } else {
            assert_eq!(row.attempts, 0);
            assert!(row.error_reason.is_none());
        }
    }
    assert_eq!(injected, 5);
    assert!(
        worker
            .metrics()
            .count("outbox_retry_scheduled_total{reason=transient.downstream_429}")
            >= 5
    );
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_crashed_worker_lease_expiry() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    for i in 0..5i64 {
        p.outbox
            .enqueue(
                EnqueueRequest::upsert("block", format!("blk-{i}"))
                    .with_version(10 + i)
                    .with_payload(json!({ "text": format!("block {i}") })),
            )
            .await
            .unwrap();
    }
    let lease = Duration::from_secs(1);
    let claimed = p.outbox.claim_batch("w-crashed", 5, lease).await.unwrap();
    assert_eq!(claimed.len(), 5);
    tokio::time::sleep(lease * 2).await;

    let survivor = p.worker("w-2", FaultConfig::default());
    let report = survivor.run_once().await.unwrap();
    assert_eq!(report.reaped, 5);
    assert_eq!(report.done, 5);
    assert!(survivor.metrics().peak_stuck() > 0);
    assert_eq!(p.snapshot().await.len(), 5);
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_operator_replay() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    let worker = p.worker("w-1", FaultConfig::default());

    let id = p
        .outbox
        .enqueue(EnqueueRequest::upsert("block", "blk-1").with_version(5).with_payload(json!({ "text": 5 })))
        .await
        .unwrap();
    p.drain(&worker).await;
    let row = p.outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.error_reason(), Some(ErrorReason::MalformedPayload));

    let audit = ReplayAudit::new("alice", "fixed projector").unwrap();
    let filter = ReplayFilter {
        limit: Some(10),
        ..Default::default()
    };
    let outcome = replay_failed(p.outbox.as_ref(), &filter, &audit, false)
        .await
        .unwrap();
    assert_eq!(outcome.replayed, vec![id]);

    let row = p.outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.replay_count, 1);
    assert_eq!(row.last_replayed_by.as_deref(), Some("alice"));
    assert_eq!(row.attempts, 0);
    assert!(row.error.is_none());
    assert!(row.error_reason.is_none());
    drop_db(db).await;
}

#[tokio::test]
#[ignore]
async fn test_pg_rebuild_direct_and_emit_outbox_agree() {
    let db = test_db().await;
    let p = PgPipeline::new(&db);
    for (name, description) in [("physics", Some("the study of matter")), ("poetry", None), ("rust", Some("systems"))] {
        sqlx::query("INSERT INTO tags (id, name, description) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(description)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    let rebuilder = Rebuilder::new(p.source.clone(), p.status.clone(), p.clock.clone());
    let outbox: &dyn OutboxStore = p.outbox.as_ref();
    rebuilder
        .rebuild_search(
            p.index.as_ref(),
            Some(outbox),
            RebuildOptions { mode: RebuildMode::Direct, truncate: true, limit: None },
        )
        .await
        .unwrap();
    let direct = p.snapshot().await;
    assert_eq!(direct.len(), 3);

    rebuilder
        .rebuild_search(
            p.index.as_ref(),
            Some(outbox),
            RebuildOptions { mode: RebuildMode::EmitOutbox, truncate: true, limit: None },
        )
        .await
        .unwrap();
    let status = p
        .status
        .get(Projection::Search.status_name())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.last_rebuild_success, Some(true));

    let worker = p.worker("w-1", FaultConfig::default());
    p.drain(&worker).await;
    let emitted = p.snapshot().await;
    assert_eq!(direct.len(), emitted.len());
    for (a, b) in direct.iter().zip(&emitted) {
        assert!(a.same_content(b), "{a:?} != {b:?}");
    }
    drop_db(db).await;
}
