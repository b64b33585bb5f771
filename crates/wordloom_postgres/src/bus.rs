//! In-process event bus.
//!
//! Handlers are registered explicitly on a [`HandlerRegistry`]; the bus is
//! built once at startup and shared by `Arc`. Each published event gets its
//! own database transaction. In [`TxMode::Savepoint`] every handler runs in a
//! nested savepoint so one failure only undoes that handler's writes; in
//! [`TxMode::Atomic`] the first failure rolls back the whole event and is
//! returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, warn};
use uuid::Uuid;

use wordloom_core::error::{ErrorReason, Result, WordloomError};
use wordloom_core::events::{DomainEvent, EventType};
use wordloom_core::trace::TraceContext;

use crate::error::db_err;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxMode {
    #[default]
    Savepoint,
    Atomic,
}

impl TxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Savepoint => "savepoint",
            Self::Atomic => "atomic",
        }
    }
}

impl std::str::FromStr for TxMode {
    type Err = WordloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "savepoint" => Ok(Self::Savepoint),
            "atomic" => Ok(Self::Atomic),
            other => Err(WordloomError::InvalidInput(format!(
                "WORDLOOM_EVENT_BUS_TX_MODE must be savepoint | atomic, got '{other}'"
            ))),
        }
    }
}

/// Per-publish context handed to every handler.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub trace: Option<TraceContext>,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event types this handler subscribes to.
    fn handles(&self) -> Vec<EventType>;

    /// Must be idempotent: the same event may be dispatched more than once.
    async fn handle(
        &self,
        conn: &mut PgConnection,
        event: &DomainEvent,
        ctx: &DispatchContext,
    ) -> Result<()>;

    /// Called after the event's transaction committed, for handlers whose
    /// writes succeeded.
    fn on_committed(&self, _event: &DomainEvent) {}
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Dispatch report ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Ok,
    Failed { reason: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerResult {
    pub handler: &'static str,
    pub outcome: HandlerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDispatch {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub results: Vec<HandlerResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub events: Vec<EventDispatch>,
}

impl DispatchReport {
    pub fn failures(&self) -> usize {
        self.events
            .iter()
            .flat_map(|e| &e.results)
            .filter(|r| matches!(r.outcome, HandlerOutcome::Failed { .. }))
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.failures() == 0
    }
}

// ── EventBus ──────────────────────────────────────────────────

pub struct EventBus {
    pool: PgPool,
    routes: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
    tx_mode: TxMode,
}

impl EventBus {
    /// Build the per-event-type dispatch table. Handlers keep registration order.
    pub fn bootstrap(pool: PgPool, registry: HandlerRegistry, tx_mode: TxMode) -> Self {
        let mut routes: HashMap<EventType, Vec<Arc<dyn EventHandler>>> = HashMap::new();
        for handler in registry.handlers {
            for event_type in handler.handles() {
                routes.entry(event_type).or_default().push(handler.clone());
            }
        }
        debug!(
            tx_mode = tx_mode.as_str(),
            routes = routes.len(),
            "event bus bootstrapped"
        );
        Self {
            pool,
            routes,
            tx_mode,
        }
    }

    pub fn tx_mode(&self) -> TxMode {
        self.tx_mode
    }

    pub fn handler_names(&self, event_type: EventType) -> Vec<&'static str> {
        self.routes
            .get(&event_type)
            .map(|hs| hs.iter().map(|h| h.name()).collect())
            .unwrap_or_default()
    }

    /// Dispatch each event in its own transaction, in order.
    pub async fn publish(
        &self,
        events: &[DomainEvent],
        trace: Option<TraceContext>,
    ) -> Result<DispatchReport> {
        let ctx = DispatchContext { trace };
        let mut report = DispatchReport::default();
        for event in events {
            report.events.push(self.dispatch_one(event, &ctx).await?);
        }
        Ok(report)
    }

    async fn dispatch_one(&self, event: &DomainEvent, ctx: &DispatchContext) -> Result<EventDispatch> {
        let event_type = event.event_type();
        let mut dispatch = EventDispatch {
            event_id: event.event_id,
            event_type,
            results: Vec::new(),
        };
        let Some(handlers) = self.routes.get(&event_type) else {
            return Ok(dispatch);
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut succeeded: Vec<&Arc<dyn EventHandler>> = Vec::with_capacity(handlers.len());

        for handler in handlers {
            match self.tx_mode {
                TxMode::Savepoint => {
                    let mut sp = sqlx::Connection::begin(&mut *tx).await.map_err(db_err)?;
                    match handler.handle(&mut sp, event, ctx).await {
                        Ok(()) => {
                            sp.commit().await.map_err(db_err)?;
                            succeeded.push(handler);
                            dispatch.results.push(HandlerResult {
                                handler: handler.name(),
                                outcome: HandlerOutcome::Ok,
                            });
                        }
                        Err(err) => {
                            warn!(
                                handler = handler.name(),
                                event_type = event_type.as_str(),
                                event_id = %event.event_id,
                                reason = err.reason().as_str(),
                                error = %err,
                                "event handler failed; savepoint rolled back"
                            );
                            sp.rollback().await.map_err(db_err)?;
                            dispatch.results.push(failed(handler.name(), &err));
                        }
                    }
                }
                TxMode::Atomic => {
                    if let Err(err) = handler.handle(&mut tx, event, ctx).await {
                        error!(
                            handler = handler.name(),
                            event_type = event_type.as_str(),
                            event_id = %event.event_id,
                            reason = err.reason().as_str(),
                            error = %err,
                            "event handler failed; dispatch rolled back"
                        );
                        tx.rollback().await.map_err(db_err)?;
                        return Err(err);
                    }
                    succeeded.push(handler);
                    dispatch.results.push(HandlerResult {
                        handler: handler.name(),
                        outcome: HandlerOutcome::Ok,
                    });
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        for handler in succeeded {
            handler.on_committed(event);
        }
        Ok(dispatch)
    }
}

fn failed(handler: &'static str, err: &WordloomError) -> HandlerResult {
    let reason: ErrorReason = err.reason();
    HandlerResult {
        handler,
        outcome: HandlerOutcome::Failed {
            reason: reason.as_str().to_string(),
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_mode_defaults_to_savepoint() {
        assert_eq!(TxMode::default(), TxMode::Savepoint);
        assert_eq!("ATOMIC".parse::<TxMode>().unwrap(), TxMode::Atomic);
        assert!("nested".parse::<TxMode>().is_err());
    }

    #[test]
    fn report_counts_failures() {
        let report = DispatchReport {
            events: vec![EventDispatch {
                event_id: Uuid::new_v4(),
                event_type: EventType::BookDeleted,
                results: vec![
                    HandlerResult {
                        handler: "a",
                        outcome: HandlerOutcome::Ok,
                    },
                    failed("b", &WordloomError::InvalidInput("bad".into())),
                ],
            }],
        };
        assert_eq!(report.failures(), 1);
        assert!(!report.is_clean());
    }
}
