//! Downstream fault injection for the search sink.
//!
//! Driven by `OUTBOX_EXPERIMENT_*`; inert unless one of them is set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use wordloom_core::error::{ErrorReason, ProjectionError};
use wordloom_core::ports::{SearchSink, SinkOperation, SinkReport};

use crate::config::{ConfigError, Env};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultConfig {
    pub es_429_every_n: Option<u64>,
    pub es_5xx_every_n: Option<u64>,
    /// Ops to target (`upsert`, `delete`); `None` targets all.
    pub ops: Option<Vec<String>>,
    pub delay: Option<Duration>,
}

impl FaultConfig {
    pub(crate) fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        let ops = env.get("OUTBOX_EXPERIMENT_OPS").map(|raw| {
            raw.split(',')
                .map(|op| op.trim().to_ascii_lowercase())
                .filter(|op| !op.is_empty())
                .collect::<Vec<_>>()
        });
        Ok(Self {
            es_429_every_n: env
                .parse::<u64>("OUTBOX_EXPERIMENT_ES_429_EVERY_N")?
                .filter(|n| *n > 0),
            es_5xx_every_n: env
                .parse::<u64>("OUTBOX_EXPERIMENT_ES_5XX_EVERY_N")?
                .filter(|n| *n > 0),
            ops: ops.filter(|o| !o.is_empty()),
            delay: env
                .parse::<u64>("OUTBOX_EXPERIMENT_DELAY_MS")?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        })
    }

    pub fn is_active(&self) -> bool {
        self.es_429_every_n.is_some() || self.es_5xx_every_n.is_some() || self.delay.is_some()
    }

    fn targets(&self, op: &SinkOperation) -> bool {
        self.ops
            .as_ref()
            .map_or(true, |ops| ops.iter().any(|o| o == op.op_name()))
    }
}

/// Wraps a sink and fails every n-th targeted operation.
pub struct FaultInjectingSink {
    inner: Arc<dyn SearchSink>,
    config: FaultConfig,
    seen: AtomicU64,
}

impl FaultInjectingSink {
    pub fn new(inner: Arc<dyn SearchSink>, config: FaultConfig) -> Self {
        Self {
            inner,
            config,
            seen: AtomicU64::new(0),
        }
    }

    /// `inner` unchanged when no experiment is configured.
    pub fn wrap(inner: Arc<dyn SearchSink>, config: FaultConfig) -> Arc<dyn SearchSink> {
        if config.is_active() {
            Arc::new(Self::new(inner, config))
        } else {
            inner
        }
    }

    fn injected(&self, ops: &[SinkOperation]) -> Option<ProjectionError> {
        let mut fault = None;
        for op in ops.iter().filter(|op| self.config.targets(op)) {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if fault.is_some() {
                continue;
            }
            if self.config.es_429_every_n.is_some_and(|every| n % every == 0) {
                fault = Some(ProjectionError::new(
                    ErrorReason::Downstream429,
                    format!("injected 429 on {} #{n}", op.op_name()),
                ));
            } else if self.config.es_5xx_every_n.is_some_and(|every| n % every == 0) {
                fault = Some(ProjectionError::new(
                    ErrorReason::Downstream5xx,
                    format!("injected 503 on {} #{n}", op.op_name()),
                ));
            }
        }
        fault
    }
}

#[async_trait]
impl SearchSink for FaultInjectingSink {
    async fn bulk(&self, ops: &[SinkOperation]) -> Result<SinkReport, ProjectionError> {
        if let Some(delay) = self.config.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.injected(ops) {
            debug!(reason = err.reason.as_str(), "fault injected");
            return Err(err);
        }
        self.inner.bulk(ops).await
    }
}

#[cfg(test)]
mod tests {
    use wordloom_core::ports::NullSink;

    use super::*;

    fn delete(id: &str) -> SinkOperation {
        SinkOperation::Delete {
            entity_type: "block".into(),
            entity_id: id.into(),
            event_version: 1,
        }
    }

    fn upsert(id: &str) -> SinkOperation {
        SinkOperation::Index(wordloom_core::read_model::SearchDocument {
            entity_type: "block".into(),
            entity_id: id.into(),
            text: "t".into(),
            snippet: "t".into(),
            rank_score: 1.0,
            event_version: 1,
            updated_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn every_second_targeted_op_fails() {
        let sink = FaultInjectingSink::new(
            Arc::new(NullSink),
            FaultConfig {
                es_429_every_n: Some(2),
                ops: Some(vec!["delete".into()]),
                ..Default::default()
            },
        );
        let mut failures = 0;
        for i in 0..10 {
            if sink.bulk(&[delete(&i.to_string())]).await.is_err() {
                failures += 1;
            }
            // upserts are not targeted and do not advance the counter
            assert!(sink.bulk(&[upsert("u")]).await.is_ok());
        }
        assert_eq!(failures, 5);
    }

    #[tokio::test]
    async fn five_xx_reason() {
        let sink = FaultInjectingSink::new(
            Arc::new(NullSink),
            FaultConfig {
                es_5xx_every_n: Some(1),
                ..Default::default()
            },
        );
        let err = sink.bulk(&[upsert("a")]).await.unwrap_err();
        assert_eq!(err.reason, ErrorReason::Downstream5xx);
    }

    #[test]
    fn inactive_config_is_a_passthrough() {
        assert!(!FaultConfig::default().is_active());
    }
}
