//! In-memory port adapters with the same guard semantics as the PostgreSQL
//! ones. Locks are never held across an await.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use wordloom_core::error::Result;
use wordloom_core::outbox::{
    BacklogStats, EnqueueRequest, OutboxRow, OutboxStatus, Projection, ReplayAudit, ReplayFilter,
    ReplayOutcome, RowFailure,
};
use wordloom_core::ports::{
    BasementStore, ChronicleStore, Clock, OutboxStore, ProjectionStatusStore, SearchIndexStore,
    SentinelStore, SourceReader,
};
use wordloom_core::read_model::{
    BasementEntry, ChronicleEntry, ProjectionStatus, SearchDocument, WriteOutcome,
};
use wordloom_core::source::{BookSnapshot, ChronicleSourceEvent, SearchEntityKind, SearchSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ── Outbox ────────────────────────────────────────────────────

pub struct InMemoryOutbox {
    projection: Projection,
    clock: Arc<dyn Clock>,
    rows: Mutex<BTreeMap<Uuid, OutboxRow>>,
}

impl InMemoryOutbox {
    pub fn new(projection: Projection, clock: Arc<dyn Clock>) -> Self {
        Self {
            projection,
            clock,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every row, lowest version first.
    pub fn rows(&self) -> Vec<OutboxRow> {
        let mut rows: Vec<_> = lock(&self.rows).values().cloned().collect();
        rows.sort_by_key(|r| (r.event_version, r.created_at));
        rows
    }

    pub fn row(&self, id: Uuid) -> Option<OutboxRow> {
        lock(&self.rows).get(&id).cloned()
    }

    pub fn count(&self, status: OutboxStatus) -> usize {
        lock(&self.rows)
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Enqueue and return the id; panics never, errors only on validation.
    pub fn enqueue_now(&self, request: EnqueueRequest) -> Result<Uuid> {
        request.validate()?;
        let row = request.into_row(self.clock.now());
        let id = row.id;
        lock(&self.rows).entry(id).or_insert(row);
        Ok(id)
    }

    fn transition(
        &self,
        id: Uuid,
        owner: &str,
        apply: impl FnOnce(&mut OutboxRow, DateTime<Utc>),
    ) -> bool {
        let now = self.clock.now();
        let mut rows = lock(&self.rows);
        match rows.get_mut(&id) {
            Some(row)
                if row.status == OutboxStatus::Processing
                    && row.owner.as_deref() == Some(owner) =>
            {
                apply(row, now);
                row.owner = None;
                row.lease_until = None;
                row.processing_started_at = None;
                row.updated_at = now;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    fn projection(&self) -> Projection {
        self.projection
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        self.enqueue_now(request)
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut reaped = 0;
        for row in lock(&self.rows).values_mut() {
            if row.status == OutboxStatus::Processing && row.lease_until.is_some_and(|l| l < now) {
                row.status = OutboxStatus::Pending;
                row.owner = None;
                row.lease_until = None;
                row.processing_started_at = None;
                row.updated_at = now;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn claim_batch(
        &self,
        owner: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxRow>> {
        let now = self.clock.now();
        let mut rows = lock(&self.rows);
        let mut visible: Vec<&mut OutboxRow> =
            rows.values_mut().filter(|r| r.is_claimable(now)).collect();
        visible.sort_by_key(|r| (r.event_version, r.created_at));
        let claimed = visible
            .into_iter()
            .take(limit as usize)
            .map(|row| {
                row.status = OutboxStatus::Processing;
                row.owner = Some(owner.to_string());
                row.processing_started_at = Some(now);
                row.lease_until = Some(now + chrono_duration(lease_ttl));
                row.updated_at = now;
                row.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_done(&self, id: Uuid, owner: &str) -> Result<bool> {
        Ok(self.transition(id, owner, |row, now| {
            row.status = OutboxStatus::Done;
            row.processed_at = Some(now);
            row.next_retry_at = None;
        }))
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        owner: &str,
        delay: Duration,
        failure: &RowFailure,
    ) -> Result<bool> {
        Ok(self.transition(id, owner, |row, now| {
            row.status = OutboxStatus::Pending;
            row.attempts += 1;
            row.next_retry_at = Some(now + chrono_duration(delay));
            row.error_reason = Some(failure.reason.as_str().to_string());
            row.error = Some(failure.message.clone());
        }))
    }

    async fn mark_failed(&self, id: Uuid, owner: &str, failure: &RowFailure) -> Result<bool> {
        Ok(self.transition(id, owner, |row, now| {
            row.status = OutboxStatus::Failed;
            row.attempts += 1;
            row.error_reason = Some(failure.reason.as_str().to_string());
            row.error = Some(failure.message.clone());
            row.processed_at = Some(now);
            row.next_retry_at = None;
        }))
    }

    async fn backlog(&self, stuck_after: Duration) -> Result<BacklogStats> {
        let now = self.clock.now();
        let stuck_before = now - chrono_duration(stuck_after);
        let rows = lock(&self.rows);
        let mut stats = BacklogStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        for row in rows.values() {
            match row.status {
                OutboxStatus::Pending | OutboxStatus::Processing => {
                    stats.lag_events += 1;
                    oldest = Some(oldest.map_or(row.created_at, |o| o.min(row.created_at)));
                }
                OutboxStatus::Done | OutboxStatus::Failed => {}
            }
            if row.status == OutboxStatus::Processing {
                stats.inflight_events += 1;
                let expired = row.lease_until.is_some_and(|l| l < now);
                let overdue = row.processing_started_at.is_some_and(|s| s < stuck_before);
                if expired || overdue {
                    stats.stuck_events += 1;
                }
            }
        }
        stats.oldest_age_seconds = oldest
            .map(|o| (now - o).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        Ok(stats)
    }

    async fn replay_failed(
        &self,
        filter: &ReplayFilter,
        audit: &ReplayAudit,
        dry_run: bool,
    ) -> Result<ReplayOutcome> {
        let now = self.clock.now();
        let mut rows = lock(&self.rows);
        let mut picked: Vec<&mut OutboxRow> =
            rows.values_mut().filter(|r| filter.matches(r, now)).collect();
        picked.sort_by_key(|r| (r.event_version, r.created_at));
        if let Some(limit) = filter.limit {
            picked.truncate(limit as usize);
        }
        if dry_run {
            return Ok(ReplayOutcome {
                matched: picked.len() as u64,
                replayed: Vec::new(),
                dry_run: true,
            });
        }
        let mut replayed = Vec::with_capacity(picked.len());
        for row in picked {
            row.status = OutboxStatus::Pending;
            row.attempts = 0;
            row.owner = None;
            row.lease_until = None;
            row.processing_started_at = None;
            row.next_retry_at = None;
            row.error_reason = None;
            row.error = None;
            row.processed_at = None;
            row.replay_count += 1;
            row.last_replayed_at = Some(now);
            row.last_replayed_by = Some(audit.by.clone());
            row.last_replayed_reason = Some(audit.reason.clone());
            row.updated_at = now;
            replayed.push(row.id);
        }
        Ok(ReplayOutcome {
            matched: replayed.len() as u64,
            replayed,
            dry_run: false,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRow>> {
        Ok(self.row(id))
    }
}

// ── Read models ───────────────────────────────────────────────

/// Guarded replace shared by the three read models: accept when the incoming
/// version is at least the stored one; keep `updated_at` on same-version
/// rewrites.
fn guarded_replace<K: Ord, V>(
    map: &mut BTreeMap<K, V>,
    key: K,
    mut incoming: V,
    version: impl Fn(&V) -> i64,
    updated_at: impl Fn(&mut V) -> &mut DateTime<Utc>,
) -> WriteOutcome {
    match map.get_mut(&key) {
        Some(current) if version(&incoming) < version(current) => WriteOutcome::Noop,
        Some(current) => {
            if version(&incoming) == version(current) {
                *updated_at(&mut incoming) = *updated_at(current);
            }
            *current = incoming;
            WriteOutcome::Applied
        }
        None => {
            map.insert(key, incoming);
            WriteOutcome::Applied
        }
    }
}

#[derive(Default)]
pub struct InMemorySearchIndex {
    docs: Mutex<BTreeMap<(String, String), SearchDocument>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchIndexStore for InMemorySearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> Result<WriteOutcome> {
        let key = (doc.entity_type.clone(), doc.entity_id.clone());
        Ok(guarded_replace(
            &mut lock(&self.docs),
            key,
            doc.clone(),
            |d| d.event_version,
            |d| &mut d.updated_at,
        ))
    }

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        event_version: i64,
    ) -> Result<WriteOutcome> {
        let key = (entity_type.to_string(), entity_id.to_string());
        let mut docs = lock(&self.docs);
        match docs.get(&key) {
            Some(doc) if doc.event_version <= event_version => {
                docs.remove(&key);
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Noop),
        }
    }

    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<SearchDocument>> {
        Ok(lock(&self.docs)
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<SearchDocument>> {
        Ok(lock(&self.docs).values().cloned().collect())
    }

    async fn truncate(&self) -> Result<u64> {
        let mut docs = lock(&self.docs);
        let n = docs.len() as u64;
        docs.clear();
        Ok(n)
    }
}

#[derive(Default)]
pub struct InMemoryChronicle {
    entries: Mutex<BTreeMap<Uuid, ChronicleEntry>>,
}

impl InMemoryChronicle {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChronicleStore for InMemoryChronicle {
    async fn upsert(&self, entry: &ChronicleEntry) -> Result<WriteOutcome> {
        let mut entries = lock(&self.entries);
        let mut incoming = entry.clone();
        if let Some(existing) = entries.get(&entry.id) {
            incoming.created_at = existing.created_at;
        }
        Ok(guarded_replace(
            &mut entries,
            entry.id,
            incoming,
            |e| e.projection_version,
            |e| &mut e.updated_at,
        ))
    }

    async fn delete(&self, id: Uuid, projection_version: i64) -> Result<WriteOutcome> {
        let mut entries = lock(&self.entries);
        match entries.get(&id) {
            Some(e) if e.projection_version <= projection_version => {
                entries.remove(&id);
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Noop),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChronicleEntry>> {
        Ok(lock(&self.entries).get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ChronicleEntry>> {
        let mut entries: Vec<_> = lock(&self.entries).values().cloned().collect();
        entries.sort_by_key(|e| (e.occurred_at, e.id));
        Ok(entries)
    }

    async fn truncate(&self) -> Result<u64> {
        let mut entries = lock(&self.entries);
        let n = entries.len() as u64;
        entries.clear();
        Ok(n)
    }
}

#[derive(Default)]
pub struct InMemoryBasement {
    entries: Mutex<BTreeMap<Uuid, BasementEntry>>,
}

impl InMemoryBasement {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BasementStore for InMemoryBasement {
    async fn upsert(&self, entry: &BasementEntry) -> Result<WriteOutcome> {
        let mut entries = lock(&self.entries);
        let mut incoming = entry.clone();
        if let Some(existing) = entries.get(&entry.book_id) {
            incoming.id = existing.id;
        }
        Ok(guarded_replace(
            &mut entries,
            entry.book_id,
            incoming,
            |e| e.event_version,
            |e| &mut e.updated_at,
        ))
    }

    async fn remove(&self, book_id: Uuid, event_version: i64) -> Result<WriteOutcome> {
        let mut entries = lock(&self.entries);
        match entries.get(&book_id) {
            Some(e) if e.event_version <= event_version => {
                entries.remove(&book_id);
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Noop),
        }
    }

    async fn get(&self, book_id: Uuid) -> Result<Option<BasementEntry>> {
        Ok(lock(&self.entries).get(&book_id).cloned())
    }

    async fn list(&self) -> Result<Vec<BasementEntry>> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    async fn truncate(&self) -> Result<u64> {
        let mut entries = lock(&self.entries);
        let n = entries.len() as u64;
        entries.clear();
        Ok(n)
    }
}

#[derive(Default)]
pub struct InMemoryProjectionStatus {
    rows: Mutex<BTreeMap<String, ProjectionStatus>>,
}

impl InMemoryProjectionStatus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStatusStore for InMemoryProjectionStatus {
    async fn record(&self, status: &ProjectionStatus) -> Result<()> {
        lock(&self.rows).insert(status.projection_name.clone(), status.clone());
        Ok(())
    }

    async fn get(&self, projection_name: &str) -> Result<Option<ProjectionStatus>> {
        Ok(lock(&self.rows).get(projection_name).cloned())
    }
}

// ── Source ────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySource {
    search: Mutex<BTreeMap<(String, String), SearchSource>>,
    books: Mutex<BTreeMap<Uuid, BookSnapshot>>,
    chronicle: Mutex<BTreeMap<Uuid, ChronicleSourceEvent>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_search(
        &self,
        kind: SearchEntityKind,
        entity_id: impl ToString,
        text: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) {
        let entity_id = entity_id.to_string();
        lock(&self.search).insert(
            (kind.as_str().to_string(), entity_id.clone()),
            SearchSource {
                kind,
                entity_id,
                text: text.into(),
                updated_at,
            },
        );
    }

    pub fn remove_search(&self, kind: SearchEntityKind, entity_id: &str) {
        lock(&self.search).remove(&(kind.as_str().to_string(), entity_id.to_string()));
    }

    pub fn put_book(&self, book: BookSnapshot) {
        lock(&self.books).insert(book.id, book);
    }

    pub fn put_chronicle_event(&self, event: ChronicleSourceEvent) {
        lock(&self.chronicle).insert(event.id, event);
    }
}

fn take_limit<T>(items: impl Iterator<Item = T>, limit: Option<u32>) -> Vec<T> {
    match limit {
        Some(n) => items.take(n as usize).collect(),
        None => items.collect(),
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    async fn search_source(
        &self,
        kind: SearchEntityKind,
        entity_id: &str,
    ) -> Result<Option<SearchSource>> {
        Ok(lock(&self.search)
            .get(&(kind.as_str().to_string(), entity_id.to_string()))
            .cloned())
    }

    async fn search_sources(&self, limit: Option<u32>) -> Result<Vec<SearchSource>> {
        Ok(take_limit(lock(&self.search).values().cloned(), limit))
    }

    async fn book(&self, book_id: Uuid) -> Result<Option<BookSnapshot>> {
        Ok(lock(&self.books).get(&book_id).cloned())
    }

    async fn basement_books(&self, limit: Option<u32>) -> Result<Vec<BookSnapshot>> {
        Ok(take_limit(
            lock(&self.books)
                .values()
                .filter(|b| b.soft_deleted_at.is_some())
                .cloned(),
            limit,
        ))
    }

    async fn chronicle_event(&self, id: Uuid) -> Result<Option<ChronicleSourceEvent>> {
        Ok(lock(&self.chronicle).get(&id).cloned())
    }

    async fn chronicle_events(&self, limit: Option<u32>) -> Result<Vec<ChronicleSourceEvent>> {
        let mut events: Vec<_> = lock(&self.chronicle).values().cloned().collect();
        events.sort_by_key(|e| (e.occurred_at, e.id));
        Ok(take_limit(events.into_iter(), limit))
    }
}

/// Sentinel with a fixed value.
pub struct InMemorySentinel(pub Option<String>);

#[async_trait]
impl SentinelStore for InMemorySentinel {
    async fn environment(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}
