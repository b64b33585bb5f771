//! Elasticsearch bulk sink.
//!
//! Documents are written with external versioning (`version_type =
//! external_gte`) so the index applies the same monotonic replacement rule as
//! `search_index`. Item-level 409 is a stale write and 404 on delete is an
//! already-gone document; both count as no-ops.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{debug, warn};

use wordloom_core::error::{ErrorReason, ProjectionError};
use wordloom_core::ports::{SearchSink, SinkOperation, SinkReport};

pub struct ElasticsearchSink {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticsearchSink {
    pub fn new(base_url: impl Into<String>, index: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into(),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }
}

/// NDJSON body for `POST /_bulk`.
pub fn bulk_body(index: &str, ops: &[SinkOperation]) -> String {
    let mut body = String::new();
    for op in ops {
        let id = op.document_id();
        match op {
            SinkOperation::Index(doc) => {
                let action = json!({
                    "index": {
                        "_index": index,
                        "_id": id,
                        "version": doc.event_version,
                        "version_type": "external_gte",
                    }
                });
                let source = json!({
                    "entity_type": doc.entity_type,
                    "entity_id": doc.entity_id,
                    "text": doc.text,
                    "snippet": doc.snippet,
                    "rank_score": doc.rank_score,
                    "event_version": doc.event_version,
                    "updated_at": doc.updated_at,
                });
                body.push_str(&action.to_string());
                body.push('\n');
                body.push_str(&source.to_string());
                body.push('\n');
            }
            SinkOperation::Delete { event_version, .. } => {
                let action = json!({
                    "delete": {
                        "_index": index,
                        "_id": id,
                        "version": event_version,
                        "version_type": "external_gte",
                    }
                });
                body.push_str(&action.to_string());
                body.push('\n');
            }
        }
    }
    body
}

fn status_error(status: u16, message: String) -> ProjectionError {
    match status {
        429 => ProjectionError::new(ErrorReason::Downstream429, message),
        500..=599 => ProjectionError::new(ErrorReason::Downstream5xx, message),
        400 => ProjectionError::malformed(message),
        _ => ProjectionError::bug(message),
    }
}

/// Interpret a bulk response. `ops` must be the operations that produced it,
/// in order.
pub fn classify_bulk_response(
    http_status: u16,
    body: &Value,
    ops: &[SinkOperation],
) -> Result<SinkReport, ProjectionError> {
    if !(200..300).contains(&http_status) {
        return Err(status_error(
            http_status,
            format!("bulk request returned HTTP {http_status}"),
        ));
    }
    let items = body
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ProjectionError::bug("bulk response has no items"))?;
    if items.len() != ops.len() {
        return Err(ProjectionError::bug(format!(
            "bulk response has {} items for {} operations",
            items.len(),
            ops.len()
        )));
    }

    let mut report = SinkReport::default();
    for (item, op) in items.iter().zip(ops) {
        let result = item
            .get(op_key(op))
            .ok_or_else(|| ProjectionError::bug(format!("bulk item missing '{}'", op_key(op))))?;
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
        match (status, op) {
            (200..=299, _) => report.applied += 1,
            (409, _) | (404, SinkOperation::Delete { .. }) => report.noops += 1,
            _ => {
                let reason = result
                    .pointer("/error/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                counter!(
                    "outbox_es_bulk_item_failures_total",
                    "op" => op.op_name(),
                    "status" => status.to_string()
                )
                .increment(1);
                return Err(status_error(
                    status,
                    format!("{} {} failed with {status}: {reason}", op.op_name(), op.document_id()),
                ));
            }
        }
    }
    Ok(report)
}

fn op_key(op: &SinkOperation) -> &'static str {
    match op {
        SinkOperation::Index(_) => "index",
        SinkOperation::Delete { .. } => "delete",
    }
}

#[async_trait]
impl SearchSink for ElasticsearchSink {
    async fn bulk(&self, ops: &[SinkOperation]) -> Result<SinkReport, ProjectionError> {
        if ops.is_empty() {
            return Ok(SinkReport::default());
        }
        for op in ops {
            counter!("outbox_es_bulk_items_total", "op" => op.op_name()).increment(1);
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header("content-type", "application/x-ndjson")
            .body(bulk_body(&self.index, ops))
            .send()
            .await;
        histogram!("outbox_es_bulk_request_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                counter!("outbox_es_bulk_requests_total", "status" => "error").increment(1);
                warn!(error = %e, "bulk request failed");
                return Err(ProjectionError::new(
                    ErrorReason::Downstream5xx,
                    format!("bulk request failed: {e}"),
                ));
            }
        };
        let status = response.status().as_u16();
        counter!("outbox_es_bulk_requests_total", "status" => status.to_string()).increment(1);

        let body: Value = if (200..300).contains(&status) {
            response.json().await.map_err(|e| {
                ProjectionError::new(
                    ErrorReason::Downstream5xx,
                    format!("unreadable bulk response: {e}"),
                )
            })?
        } else {
            Value::Null
        };
        let report = classify_bulk_response(status, &body, ops)?;
        debug!(applied = report.applied, noops = report.noops, "bulk applied");
        Ok(report)
    }
}
