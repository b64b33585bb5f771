//! Built-in bus handler: the basement projection.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;
use tracing::debug;

use wordloom_core::error::Result;
use wordloom_core::events::{DomainEvent, EventType};
use wordloom_core::projector::{mutation_for, BasementMutation};

use crate::bus::{DispatchContext, EventHandler};
use crate::read_models::{remove_basement, upsert_basement};
use crate::source::load_book;

/// Keeps `basement_entries` in step with book lifecycle events, inside the
/// publishing transaction.
#[derive(Debug, Default)]
pub struct BasementProjectionHandler;

#[async_trait]
impl EventHandler for BasementProjectionHandler {
    fn name(&self) -> &'static str {
        "basement_projection"
    }

    fn handles(&self) -> Vec<EventType> {
        vec![
            EventType::BookMovedToBasement,
            EventType::BookRestoredFromBasement,
            EventType::BookDeleted,
        ]
    }

    async fn handle(
        &self,
        conn: &mut PgConnection,
        event: &DomainEvent,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        let outcome = match mutation_for(event) {
            None => return Ok(()),
            Some(BasementMutation::Remove {
                book_id,
                event_version,
            }) => remove_basement(conn, book_id, event_version).await?,
            Some(BasementMutation::Upsert(draft)) => {
                let book = if draft.needs_source() {
                    load_book(conn, draft.book_id).await?
                } else {
                    None
                };
                let entry = draft.complete(book.as_ref(), Utc::now())?;
                upsert_basement(conn, &entry).await?
            }
        };
        debug!(event_type = event.event_type().as_str(), ?outcome, "basement projection applied");
        Ok(())
    }
}
