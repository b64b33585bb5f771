//! Lease-based outbox worker.
//!
//! One worker drives one outbox table through its projector. Each cycle:
//!
//! 1. sample backlog gauges (stuck rows are visible before the reaper runs)
//! 2. reap expired leases back to `pending`
//! 3. claim a batch (`FOR UPDATE SKIP LOCKED`, lowest `event_version` first)
//! 4. apply every row inside an `outbox.process` span, then move it to
//!    `done`, back to `pending` with a retry delay, or to `failed`
//!
//! Every transition is guarded by `owner = worker_id AND status =
//! 'processing'`; a guard miss means another worker reclaimed the row after
//! our lease expired and is recorded as `transient.lease_lost`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::field::{display, Empty};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use wordloom_core::error::{ErrorReason, ProjectionError, Result};
use wordloom_core::outbox::{OutboxRow, RowFailure};
use wordloom_core::ports::{Clock, OutboxStore};
use wordloom_core::projector::{ApplyOutcome, Projector};
use wordloom_core::retry::IdleBackoff;
use wordloom_core::trace::TraceContext;

use crate::config::WorkerOptions;
use crate::health::WorkerHealth;
use crate::telemetry::OutboxMetrics;

/// Where a processed row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Done,
    /// Done, but the read model already held this version or newer.
    Noop,
    Retried,
    Failed,
    LeaseLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub reaped: u64,
    pub claimed: usize,
    pub done: usize,
    pub noops: usize,
    pub retried: usize,
    pub failed: usize,
    pub lease_lost: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Done => self.done += 1,
            RowOutcome::Noop => {
                self.done += 1;
                self.noops += 1;
            }
            RowOutcome::Retried => self.retried += 1,
            RowOutcome::Failed => self.failed += 1,
            RowOutcome::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// Decision for a failed delivery.
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Retry(RowFailure),
    Terminal(RowFailure),
}

/// Log correlation key: the originating trace id when the row carries one,
/// else the row id.
fn correlation_id(row: &OutboxRow) -> String {
    row.trace_context()
        .map(|t| t.trace_id)
        .unwrap_or_else(|| row.id.to_string())
}

pub struct OutboxWorker {
    outbox: Arc<dyn OutboxStore>,
    projector: Arc<dyn Projector>,
    options: WorkerOptions,
    metrics: Arc<OutboxMetrics>,
    health: Arc<WorkerHealth>,
    clock: Arc<dyn Clock>,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        projector: Arc<dyn Projector>,
        options: WorkerOptions,
        metrics: Arc<OutboxMetrics>,
        health: Arc<WorkerHealth>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbox,
            projector,
            options,
            metrics,
            health,
            clock,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    pub fn metrics(&self) -> &Arc<OutboxMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<WorkerHealth> {
        &self.health
    }

    /// Run until `shutdown` flips to true. The batch in flight always
    /// finishes; no new batch is claimed afterwards.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let projection = self.projector.projection();
        info!(
            projection = projection.as_str(),
            worker_id = %self.options.worker_id,
            batch_size = self.options.batch_size,
            lease_ttl_secs = self.options.lease_ttl.as_secs(),
            "outbox worker started"
        );
        let mut idle = IdleBackoff::new(self.options.idle_backoff_min, self.options.idle_backoff_max);

        loop {
            if *shutdown.borrow() || self.health.stop_requested() {
                break;
            }
            self.health.touch();

            let sleep = match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    idle.reset();
                    continue;
                }
                Ok(_) => idle.next_sleep(),
                Err(err) => {
                    error!(error = %err, "outbox cycle aborted");
                    self.options.db_error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.health.mark_stopped();
        info!(projection = projection.as_str(), "outbox worker stopped");
    }

    /// One reap/claim/process cycle. A database error aborts the batch;
    /// rows already claimed keep their lease and are reaped later.
    pub async fn run_once(&self) -> Result<CycleReport> {
        match self.cycle().await {
            Ok(report) => {
                self.health.record_db_ok();
                Ok(report)
            }
            Err(err) => {
                self.health.record_db_failure(&err);
                Err(err)
            }
        }
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let backlog = self.outbox.backlog(self.options.max_processing).await?;
        self.metrics.observe_backlog(&backlog);
        if backlog.stuck_events > 0 {
            warn!(stuck = backlog.stuck_events, "processing rows past their lease or window");
        }

        report.reaped = self.outbox.reap_expired_leases().await?;
        if report.reaped > 0 {
            info!(reaped = report.reaped, "expired leases returned to pending");
        }

        if self.health.stop_requested() {
            return Ok(report);
        }

        let rows = self
            .outbox
            .claim_batch(
                &self.options.worker_id,
                self.options.batch_size,
                self.options.lease_ttl,
            )
            .await?;
        report.claimed = rows.len();

        for row in &rows {
            let outcome = self.process(row).await?;
            report.record(outcome);
        }
        if report.claimed > 0 {
            debug!(?report, "outbox cycle finished");
        }
        Ok(report)
    }

    fn row_span(&self, row: &OutboxRow) -> Span {
        let span = info_span!(
            "outbox.process",
            projection = self.projector.projection().as_str(),
            worker_id = %self.options.worker_id,
            row_id = %row.id,
            entity_type = %row.entity_type,
            entity_id = %row.entity_id,
            op = row.op.as_str(),
            event_version = row.event_version,
            attempts = row.attempts,
            correlation_id = %correlation_id(row),
            error_reason = Empty,
            trace_id = Empty,
            span_id = Empty,
            parent_span_id = Empty,
        );
        if self.options.tracing_enabled {
            if let Some(parent) = row.trace_context() {
                let this = TraceContext::child(&parent);
                span.record("trace_id", parent.trace_id.as_str());
                span.record("span_id", this.span_id.as_str());
                span.record("parent_span_id", parent.span_id.as_str());
            }
        }
        span
    }

    async fn process(&self, row: &OutboxRow) -> Result<RowOutcome> {
        let span = self.row_span(row);
        async {
            let applied = match tokio::time::timeout(
                self.options.row_timeout(),
                self.projector.apply(row),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProjectionError::new(
                    ErrorReason::LeaseLost,
                    format!(
                        "projector exceeded its {}s processing window",
                        self.options.row_timeout().as_secs()
                    ),
                )),
            };

            match applied {
                Ok(outcome) => self.complete(row, outcome).await,
                Err(err) => self.fail(row, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn complete(&self, row: &OutboxRow, outcome: ApplyOutcome) -> Result<RowOutcome> {
        if !self.outbox.mark_done(row.id, &self.options.worker_id).await? {
            return Ok(self.lease_lost(row));
        }
        self.metrics.processed(&row.entity_type, row.op);
        self.metrics.last_success(self.clock.now());
        match outcome {
            ApplyOutcome::Applied => {
                debug!("row applied");
                Ok(RowOutcome::Done)
            }
            ApplyOutcome::Noop => {
                self.metrics.idempotent_noop(&row.entity_type);
                debug!("row was an idempotent noop");
                Ok(RowOutcome::Noop)
            }
        }
    }

    async fn fail(&self, row: &OutboxRow, err: ProjectionError) -> Result<RowOutcome> {
        self.metrics.failed(row.op, err.reason);
        match self.disposition(row, err) {
            Disposition::Retry(failure) => {
                let attempts = row.attempts.max(0) as u32 + 1;
                let delay = self.options.retry.delay(attempts);
                let moved = self
                    .outbox
                    .schedule_retry(row.id, &self.options.worker_id, delay, &failure)
                    .await?;
                if !moved {
                    return Ok(self.lease_lost(row));
                }
                self.metrics.retry_scheduled(row.op, failure.reason);
                Span::current().record("error_reason", display(failure.reason.as_str()));
                warn!(
                    error_reason = %failure.reason.as_str(),
                    error = %failure.message,
                    delay_ms = delay.as_millis() as u64,
                    "row scheduled for retry"
                );
                Ok(RowOutcome::Retried)
            }
            Disposition::Terminal(failure) => {
                let moved = self
                    .outbox
                    .mark_failed(row.id, &self.options.worker_id, &failure)
                    .await?;
                if !moved {
                    return Ok(self.lease_lost(row));
                }
                self.metrics.terminal_failed(row.op, failure.reason);
                Span::current().record("error_reason", display(failure.reason.as_str()));
                error!(
                    error_reason = %failure.reason.as_str(),
                    error = %failure.message,
                    "row failed terminally"
                );
                Ok(RowOutcome::Failed)
            }
        }
    }

    /// Deliveries so far include this one: `attempts + 1`.
    fn disposition(&self, row: &OutboxRow, err: ProjectionError) -> Disposition {
        let deliveries = row.attempts.max(0) as u32 + 1;
        match err.reason {
            ErrorReason::MissingSource => {
                if deliveries >= self.projector.missing_source_limit() {
                    Disposition::Terminal(RowFailure::new(
                        ErrorReason::MissingSourceExhausted,
                        format!("{} (after {deliveries} deliveries)", err.message),
                    ))
                } else {
                    Disposition::Retry(RowFailure::new(err.reason, err.message))
                }
            }
            reason if reason.is_retryable() => {
                if self.options.retry.exhausted(deliveries) {
                    Disposition::Terminal(RowFailure::new(
                        reason,
                        format!("{} (retries exhausted after {deliveries})", err.message),
                    ))
                } else {
                    Disposition::Retry(RowFailure::new(reason, err.message))
                }
            }
            reason => Disposition::Terminal(RowFailure::new(reason, err.message)),
        }
    }

    fn lease_lost(&self, row: &OutboxRow) -> RowOutcome {
        self.metrics.failed(row.op, ErrorReason::LeaseLost);
        Span::current().record("error_reason", display(ErrorReason::LeaseLost.as_str()));
        warn!(
            error_reason = %ErrorReason::LeaseLost.as_str(),
            row_id = %row.id,
            "lease lost before the row could be transitioned"
        );
        RowOutcome::LeaseLost
    }
}
