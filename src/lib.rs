//! Wordloom projection pipeline.
//!
//! Domain types, projectors and port traits live in `wordloom_core`; the
//! PostgreSQL adapters, event bus and outbox writer in `wordloom_postgres`.
//! This crate holds what runs them: the lease-based outbox worker, the
//! rebuild and replay tooling, the Elasticsearch sink, health endpoints and
//! telemetry. Binaries are under `src/bin/`.

pub mod bootstrap;
pub mod config;
pub mod faults;
pub mod health;
pub mod http;
pub mod rebuild;
pub mod replay;
pub mod sink;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, WorkerConfig, WorkerOptions};
pub use faults::{FaultConfig, FaultInjectingSink};
pub use health::{WorkerHealth, WorkerState};
pub use rebuild::{RebuildArgs, RebuildMode, RebuildOptions, RebuildReport, Rebuilder};
pub use replay::{replay_failed, ReplayArgs};
pub use sink::ElasticsearchSink;
pub use telemetry::OutboxMetrics;
pub use worker::{CycleReport, OutboxWorker, RowOutcome};
