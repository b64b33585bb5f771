//! Offline rebuild of the read models from the authoritative source tables.
//!
//! `direct` reads the source in one snapshot and writes the read model
//! itself; `emit-outbox` enqueues one `pending` row per source entity and
//! leaves the writing to the worker. Both outcomes are recorded in
//! `projection_status` and in the `projection_rebuild_*` metrics.

use std::future::Future;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use tracing::{error, info};

use wordloom_core::error::{Result, WordloomError};
use wordloom_core::outbox::{
    next_event_version, version_from_timestamp, EnqueueRequest, Projection,
};
use wordloom_core::ports::{
    BasementStore, ChronicleStore, Clock, OutboxStore, ProjectionStatusStore, SearchIndexStore,
    SourceReader,
};
use wordloom_core::projector::{build_document, build_entry, BasementDraft, Provenance};
use wordloom_core::read_model::ProjectionStatus;
use wordloom_postgres::CHRONICLE_ENTITY_TYPE;

use crate::telemetry::record_rebuild;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildMode {
    Direct,
    EmitOutbox,
}

/// Flags shared by the three rebuild binaries.
#[derive(Debug, Clone, Args)]
pub struct RebuildArgs {
    /// Clear the read model before rebuilding.
    #[arg(long)]
    pub truncate: bool,

    /// Enqueue outbox rows instead of writing the read model directly.
    #[arg(long, conflicts_with = "direct")]
    pub emit_outbox: bool,

    /// Write the read model directly (default).
    #[arg(long)]
    pub direct: bool,

    /// Stop after N source rows.
    #[arg(long)]
    pub limit: Option<u32>,
}

impl RebuildArgs {
    pub fn options(&self) -> RebuildOptions {
        RebuildOptions {
            mode: if self.emit_outbox {
                RebuildMode::EmitOutbox
            } else {
                RebuildMode::Direct
            },
            truncate: self.truncate,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildOptions {
    pub mode: RebuildMode,
    pub truncate: bool,
    pub limit: Option<u32>,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            mode: RebuildMode::Direct,
            truncate: false,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub projection: Projection,
    pub mode: RebuildMode,
    pub truncated: u64,
    pub rows_written: u64,
    pub duration_seconds: f64,
}

pub struct Rebuilder {
    source: Arc<dyn SourceReader>,
    status: Arc<dyn ProjectionStatusStore>,
    clock: Arc<dyn Clock>,
}

impl Rebuilder {
    pub fn new(
        source: Arc<dyn SourceReader>,
        status: Arc<dyn ProjectionStatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            status,
            clock,
        }
    }

    pub async fn rebuild_search(
        &self,
        index: &dyn SearchIndexStore,
        outbox: Option<&dyn OutboxStore>,
        options: RebuildOptions,
    ) -> Result<RebuildReport> {
        self.tracked(Projection::Search, options, async {
            let truncated = if options.truncate { index.truncate().await? } else { 0 };
            let sources = self.source.search_sources(options.limit).await?;
            let now = self.clock.now();
            let mut written = 0u64;
            match options.mode {
                RebuildMode::Direct => {
                    for source in &sources {
                        let doc = build_document(
                            source.kind,
                            &source.entity_id,
                            &source.text,
                            version_from_timestamp(source.updated_at),
                            now,
                        );
                        index.upsert(&doc).await?;
                        written += 1;
                    }
                }
                RebuildMode::EmitOutbox => {
                    let outbox = require_outbox(outbox, Projection::Search)?;
                    for source in &sources {
                        outbox
                            .enqueue(
                                EnqueueRequest::upsert(source.kind.as_str(), &source.entity_id)
                                    .with_version(version_from_timestamp(source.updated_at))
                                    .with_event_type("rebuild"),
                            )
                            .await?;
                        written += 1;
                    }
                }
            }
            Ok((truncated, written))
        })
        .await
    }

    /// Every entry gets one fresh `projection_version`, newer than any live
    /// write so far, so rebuilt rows replace live ones.
    pub async fn rebuild_chronicle(
        &self,
        store: &dyn ChronicleStore,
        outbox: Option<&dyn OutboxStore>,
        options: RebuildOptions,
    ) -> Result<RebuildReport> {
        self.tracked(Projection::Chronicle, options, async {
            let projection_version = next_event_version();
            let truncated = if options.truncate { store.truncate().await? } else { 0 };
            let events = self.source.chronicle_events(options.limit).await?;
            let now = self.clock.now();
            let mut written = 0u64;
            match options.mode {
                RebuildMode::Direct => {
                    for event in &events {
                        let entry = build_entry(event, Provenance::Rebuild, projection_version, now)?;
                        store.upsert(&entry).await?;
                        written += 1;
                    }
                }
                RebuildMode::EmitOutbox => {
                    let outbox = require_outbox(outbox, Projection::Chronicle)?;
                    for event in &events {
                        outbox
                            .enqueue(
                                EnqueueRequest::upsert(CHRONICLE_ENTITY_TYPE, event.id)
                                    .with_version(projection_version)
                                    .with_event_type(event.event_type.clone()),
                            )
                            .await?;
                        written += 1;
                    }
                }
            }
            Ok((truncated, written))
        })
        .await
    }

    /// Basement has no outbox; only `direct` is accepted.
    pub async fn rebuild_basement(
        &self,
        store: &dyn BasementStore,
        options: RebuildOptions,
    ) -> Result<RebuildReport> {
        self.tracked(Projection::Basement, options, async {
            if options.mode == RebuildMode::EmitOutbox {
                return Err(WordloomError::InvalidInput(
                    "basement has no outbox; use --direct".into(),
                ));
            }
            let truncated = if options.truncate { store.truncate().await? } else { 0 };
            let books = self.source.basement_books(options.limit).await?;
            let now = self.clock.now();
            let mut written = 0u64;
            for book in &books {
                let entry = BasementDraft::from_book(book).complete(Some(book), now)?;
                store.upsert(&entry).await?;
                written += 1;
            }
            Ok((truncated, written))
        })
        .await
    }

    async fn tracked<F>(
        &self,
        projection: Projection,
        options: RebuildOptions,
        work: F,
    ) -> Result<RebuildReport>
    where
        F: Future<Output = Result<(u64, u64)>>,
    {
        let name = projection.status_name();
        let started = self.clock.now();
        let timer = std::time::Instant::now();
        info!(projection = name, mode = ?options.mode, truncate = options.truncate, limit = ?options.limit, "rebuild started");

        let result = work.await;
        let finished = self.clock.now();
        let seconds = timer.elapsed().as_secs_f64();

        match result {
            Ok((truncated, written)) => {
                self.status
                    .record(&ProjectionStatus::succeeded(
                        name,
                        started,
                        finished,
                        written as i64,
                    ))
                    .await?;
                record_rebuild(projection, seconds, finished, true);
                info!(projection = name, truncated, rows_written = written, seconds, "rebuild finished");
                Ok(RebuildReport {
                    projection,
                    mode: options.mode,
                    truncated,
                    rows_written: written,
                    duration_seconds: seconds,
                })
            }
            Err(err) => {
                let status = ProjectionStatus::failed(name, started, finished, err.to_string());
                if let Err(status_err) = self.status.record(&status).await {
                    error!(error = %status_err, "could not record failed rebuild status");
                }
                record_rebuild(projection, seconds, finished, false);
                error!(projection = name, error = %err, "rebuild failed");
                Err(err)
            }
        }
    }
}

fn require_outbox<'a>(
    outbox: Option<&'a dyn OutboxStore>,
    projection: Projection,
) -> Result<&'a dyn OutboxStore> {
    outbox.ok_or_else(|| {
        WordloomError::InvalidInput(format!("--emit-outbox needs the {projection} outbox"))
    })
}
