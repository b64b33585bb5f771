use std::sync::Mutex;

use async_trait::async_trait;

use wordloom_core::error::ProjectionError;
use wordloom_core::ports::{SearchSink, SinkOperation, SinkReport};

/// Sink that remembers every accepted call and can be told to fail the next
/// `n` calls with a fixed error.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<Vec<SinkOperation>>>,
    failures: Mutex<Option<(u32, ProjectionError)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32, error: ProjectionError) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = Some((n, error));
    }

    /// Accepted calls, oldest first.
    pub fn calls(&self) -> Vec<Vec<SinkOperation>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn operations(&self) -> Vec<SinkOperation> {
        self.calls().into_iter().flatten().collect()
    }
}

#[async_trait]
impl SearchSink for RecordingSink {
    async fn bulk(&self, ops: &[SinkOperation]) -> Result<SinkReport, ProjectionError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((remaining, error)) = failures.as_mut() {
                let error = error.clone();
                *remaining -= 1;
                if *remaining == 0 {
                    *failures = None;
                }
                return Err(error);
            }
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ops.to_vec());
        Ok(SinkReport {
            applied: ops.len(),
            noops: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wordloom_core::error::ErrorReason;

    #[tokio::test]
    async fn fails_exactly_n_times() {
        let sink = RecordingSink::new();
        sink.fail_next(2, ProjectionError::new(ErrorReason::Downstream5xx, "boom"));
        let op = SinkOperation::Delete {
            entity_type: "block".into(),
            entity_id: "1".into(),
            event_version: 1,
        };
        assert!(sink.bulk(&[op.clone()]).await.is_err());
        assert!(sink.bulk(&[op.clone()]).await.is_err());
        assert!(sink.bulk(&[op.clone()]).await.is_ok());
        assert_eq!(sink.operations(), vec![op]);
    }
}
