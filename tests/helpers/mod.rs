//! Shared wiring for the pipeline integration tests: a search pipeline over
//! the in-memory harness with a manual clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use wordloom::{CycleReport, FaultConfig, FaultInjectingSink, OutboxMetrics, OutboxWorker, WorkerHealth, WorkerOptions};
use wordloom_core::outbox::{OutboxStatus, Projection};
use wordloom_core::ports::{Clock, SearchIndexStore};
use wordloom_core::projector::{Projector, SearchProjector};
use wordloom_core::read_model::SearchDocument;
use wordloom_core::retry::RetryPolicy;
use wordloom_core::source::SearchEntityKind;
use wordloom_harness::{
    InMemoryOutbox, InMemoryProjectionStatus, InMemorySearchIndex, InMemorySource, ManualClock,
    RecordingSink,
};

/// Clock step between drain cycles; longer than any retry delay below.
pub const CYCLE_STEP: Duration = Duration::from_secs(2);

pub fn worker_options(worker_id: &str) -> WorkerOptions {
    WorkerOptions {
        worker_id: worker_id.to_string(),
        batch_size: 50,
        retry: RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            max_attempts: 8,
        },
        ..Default::default()
    }
}

pub struct SearchPipeline {
    pub clock: Arc<ManualClock>,
    pub outbox: Arc<InMemoryOutbox>,
    pub index: Arc<InMemorySearchIndex>,
    pub source: Arc<InMemorySource>,
    pub sink: Arc<RecordingSink>,
    pub status: Arc<InMemoryProjectionStatus>,
}

impl SearchPipeline {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::at_epoch());
        Self {
            outbox: Arc::new(InMemoryOutbox::new(Projection::Search, clock.clone())),
            index: Arc::new(InMemorySearchIndex::new()),
            source: Arc::new(InMemorySource::new()),
            sink: Arc::new(RecordingSink::new()),
            status: Arc::new(InMemoryProjectionStatus::new()),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Search projector over this pipeline's stores, its sink wrapped with
    /// `faults`.
    pub fn projector(&self, faults: FaultConfig) -> Arc<dyn Projector> {
        Arc::new(SearchProjector::new(
            self.index.clone(),
            self.source.clone(),
            FaultInjectingSink::wrap(self.sink.clone(), faults),
            self.clock(),
        ))
    }

    pub fn worker(&self, worker_id: &str) -> OutboxWorker {
        self.worker_with(worker_id, self.projector(FaultConfig::default()))
    }

    pub fn worker_with(&self, worker_id: &str, projector: Arc<dyn Projector>) -> OutboxWorker {
        OutboxWorker::new(
            self.outbox.clone(),
            projector,
            worker_options(worker_id),
            Arc::new(OutboxMetrics::new(Projection::Search)),
            Arc::new(WorkerHealth::new(
                Projection::Search,
                worker_id,
                Duration::from_secs(60),
            )),
            self.clock(),
        )
    }

    /// Run cycles until nothing is pending or processing, stepping the clock
    /// past retry delays. Returns the summed report.
    pub async fn drain(&self, worker: &OutboxWorker) -> CycleReport {
        let mut total = CycleReport::default();
        for _ in 0..50 {
            let report = worker.run_once().await.expect("cycle failed");
            total.reaped += report.reaped;
            total.claimed += report.claimed;
            total.done += report.done;
            total.noops += report.noops;
            total.retried += report.retried;
            total.failed += report.failed;
            total.lease_lost += report.lease_lost;
            if self.open_rows() == 0 {
                return total;
            }
            self.clock.advance(CYCLE_STEP);
        }
        panic!("outbox did not drain: {:?}", self.outbox.rows());
    }

    pub fn open_rows(&self) -> usize {
        self.outbox.count(OutboxStatus::Pending) + self.outbox.count(OutboxStatus::Processing)
    }

    pub async fn doc(&self, kind: SearchEntityKind, entity_id: &str) -> Option<SearchDocument> {
        self.index.get(kind.as_str(), entity_id).await.unwrap()
    }

    /// Index contents ordered by `(entity_type, entity_id)`.
    pub async fn snapshot(&self) -> Vec<SearchDocument> {
        let mut docs = self.index.list().await.unwrap();
        docs.sort_by(|a, b| (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id)));
        docs
    }
}
