//! Projectors turn outbox rows (or bus events) into read-model writes.
//!
//! Every projector is idempotent and safe under out-of-order delivery: the
//! stores only accept writes whose version is at least the stored one, and a
//! delete of a row that is already gone is a noop.

mod basement;
mod chronicle;
mod search;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProjectionError;
use crate::outbox::{OutboxRow, Projection};
use crate::read_model::WriteOutcome;

pub use basement::{mutation_for, BasementDraft, BasementMutation};
pub use chronicle::{
    build_entry, envelope, summarize, ChronicleProjector, Provenance, SCHEMA_VERSION,
};
pub use search::{build_document, rank_score, snippet, SearchProjector, SNIPPET_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// Read model already at this version or newer; counted as an idempotent noop.
    Noop,
}

impl From<WriteOutcome> for ApplyOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Applied => Self::Applied,
            WriteOutcome::Noop => Self::Noop,
        }
    }
}

#[async_trait]
pub trait Projector: Send + Sync {
    fn projection(&self) -> Projection;

    /// Deliveries after which `missing_source` becomes terminal.
    fn missing_source_limit(&self) -> u32 {
        1
    }

    async fn apply(&self, row: &OutboxRow) -> Result<ApplyOutcome, ProjectionError>;
}

/// Parse an optional JSON object hint; anything other than an object or null
/// is a malformed payload.
pub(crate) fn payload_object(
    payload: Option<&serde_json::Value>,
) -> Result<Option<&serde_json::Map<String, serde_json::Value>>, ProjectionError> {
    match payload {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(ProjectionError::malformed(format!(
            "payload must be a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
