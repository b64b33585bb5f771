//! Logging and metrics.
//!
//! Logs go through `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`,
//! default `info,wordloom=debug`). Metrics go through the `metrics` facade;
//! binaries that serve `/metrics` install the Prometheus recorder.
//!
//! # Metrics
//!
//! ## Counters
//! - `outbox_processed_total{projection, entity_type, op}`
//! - `outbox_failed_total{projection, op, reason}`: every failed delivery
//! - `outbox_retry_scheduled_total{projection, op, reason}`
//! - `outbox_terminal_failed_total{projection, op, reason}`
//! - `outbox_idempotent_noop_total{projection, entity_type}`
//!
//! ## Gauges
//! - `outbox_lag_events`, `outbox_oldest_age_seconds`,
//!   `outbox_inflight_events`, `outbox_stuck_processing_events`,
//!   `outbox_last_success_timestamp_seconds` (all `{projection}`)

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use wordloom_core::error::ErrorReason;
use wordloom_core::outbox::{BacklogStats, OutboxOp, Projection};

const DEFAULT_FILTER: &str = "info,wordloom=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("expected json | pretty, got '{other}'")),
        }
    }
}

impl LogFormat {
    /// `WORDLOOM_LOG_FORMAT`, falling back to `default` when unset or unreadable.
    pub fn from_env_or(default: LogFormat) -> Self {
        std::env::var("WORDLOOM_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Install the Prometheus recorder and return the handle used to render `/metrics`.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))
}

// ── Outbox metrics ────────────────────────────────────────────

/// Emits the worker's metrics and keeps an in-process tally of them.
///
/// The tally is keyed by metric name, and by metric name plus one label
/// (`outbox_retry_scheduled_total{reason=transient.downstream_429}`,
/// `outbox_failed_total{op=delete}`). It is what `/healthz` reports under
/// `counters`.
pub struct OutboxMetrics {
    projection: Projection,
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<&'static str, f64>>,
    peak_stuck: Mutex<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<&'static str, f64>,
}

impl OutboxMetrics {
    pub fn new(projection: Projection) -> Self {
        Self {
            projection,
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
            peak_stuck: Mutex::new(0),
        }
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    fn tally(&self, key: String) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, value);
        gauge!(name, "projection" => self.projection.as_str()).set(value);
    }

    pub fn processed(&self, entity_type: &str, op: OutboxOp) {
        counter!(
            "outbox_processed_total",
            "projection" => self.projection.as_str(),
            "entity_type" => entity_type.to_string(),
            "op" => op.as_str()
        )
        .increment(1);
        self.tally("outbox_processed_total".into());
    }

    pub fn idempotent_noop(&self, entity_type: &str) {
        counter!(
            "outbox_idempotent_noop_total",
            "projection" => self.projection.as_str(),
            "entity_type" => entity_type.to_string()
        )
        .increment(1);
        self.tally("outbox_idempotent_noop_total".into());
    }

    pub fn failed(&self, op: OutboxOp, reason: ErrorReason) {
        self.reasoned("outbox_failed_total", op, reason);
    }

    pub fn retry_scheduled(&self, op: OutboxOp, reason: ErrorReason) {
        self.reasoned("outbox_retry_scheduled_total", op, reason);
    }

    pub fn terminal_failed(&self, op: OutboxOp, reason: ErrorReason) {
        self.reasoned("outbox_terminal_failed_total", op, reason);
    }

    fn reasoned(&self, name: &'static str, op: OutboxOp, reason: ErrorReason) {
        counter!(
            name,
            "projection" => self.projection.as_str(),
            "op" => op.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
        self.tally(name.to_string());
        self.tally(format!("{name}{{reason={}}}", reason.as_str()));
        self.tally(format!("{name}{{op={}}}", op.as_str()));
    }

    pub fn last_success(&self, at: DateTime<Utc>) {
        self.set_gauge(
            "outbox_last_success_timestamp_seconds",
            at.timestamp_millis() as f64 / 1000.0,
        );
    }

    pub fn observe_backlog(&self, stats: &BacklogStats) {
        self.set_gauge("outbox_lag_events", stats.lag_events as f64);
        self.set_gauge("outbox_oldest_age_seconds", stats.oldest_age_seconds);
        self.set_gauge("outbox_inflight_events", stats.inflight_events as f64);
        self.set_gauge("outbox_stuck_processing_events", stats.stuck_events as f64);
        let mut peak = self.peak_stuck.lock().unwrap_or_else(|e| e.into_inner());
        *peak = (*peak).max(stats.stuck_events);
    }

    /// Tally for `name`; `name{reason=…}` selects one reason.
    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    /// Highest stuck-row count seen since start.
    pub fn peak_stuck(&self) -> i64 {
        *self.peak_stuck.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            gauges: self.gauges.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

// ── Rebuild metrics ───────────────────────────────────────────

pub fn record_rebuild(projection: Projection, seconds: f64, finished: DateTime<Utc>, ok: bool) {
    let name = projection.status_name();
    metrics::histogram!("projection_rebuild_duration_seconds", "projection" => name)
        .record(seconds);
    gauge!("projection_rebuild_last_finished_timestamp_seconds", "projection" => name)
        .set(finished.timestamp_millis() as f64 / 1000.0);
    gauge!("projection_rebuild_last_success", "projection" => name).set(if ok { 1.0 } else { 0.0 });
}
