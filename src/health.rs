//! Worker health state shared between the loop, the signal task and the
//! health endpoints.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use wordloom_core::outbox::Projection;

/// Consecutive database failures that flip the worker to `DEGRADED`.
pub const DEGRADED_AFTER_DB_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Running,
    Degraded,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DbHealth {
    pub ok: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub ok: bool,
    pub reason: Option<String>,
    pub projection: Projection,
    pub worker_id: String,
    pub state: WorkerState,
    pub stop_requested: bool,
    pub stop_reason: Option<String>,
    pub last_loop_ago_seconds: Option<f64>,
    pub db: DbHealth,
}

#[derive(Debug)]
struct Inner {
    state: WorkerState,
    stop_requested: bool,
    stop_reason: Option<String>,
    last_loop_at: Option<Instant>,
    db: DbHealth,
}

/// Extra `/readyz` condition; `Err` carries the reason reported to callers.
pub type ReadyCheck = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

pub struct WorkerHealth {
    projection: Projection,
    worker_id: String,
    silence: Duration,
    ready_check: Option<ReadyCheck>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHealth")
            .field("projection", &self.projection)
            .field("worker_id", &self.worker_id)
            .field("silence", &self.silence)
            .field("ready_check", &self.ready_check.is_some())
            .field("inner", &self.inner)
            .finish()
    }
}

impl WorkerHealth {
    pub fn new(projection: Projection, worker_id: impl Into<String>, silence: Duration) -> Self {
        Self {
            projection,
            worker_id: worker_id.into(),
            silence,
            ready_check: None,
            inner: Mutex::new(Inner {
                state: WorkerState::Running,
                stop_requested: false,
                stop_reason: None,
                last_loop_at: None,
                db: DbHealth {
                    ok: true,
                    consecutive_failures: 0,
                    last_error: None,
                },
            }),
        }
    }

    /// Gate `/readyz` on an additional condition, evaluated on every probe.
    pub fn with_ready_check(mut self, check: ReadyCheck) -> Self {
        self.ready_check = Some(check);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Heartbeat from the loop.
    pub fn touch(&self) {
        self.lock().last_loop_at = Some(Instant::now());
    }

    pub fn record_db_ok(&self) {
        let mut inner = self.lock();
        inner.db.ok = true;
        inner.db.consecutive_failures = 0;
        if inner.state == WorkerState::Degraded {
            inner.state = WorkerState::Running;
        }
    }

    pub fn record_db_failure(&self, error: impl ToString) {
        let mut inner = self.lock();
        inner.db.ok = false;
        inner.db.consecutive_failures += 1;
        inner.db.last_error = Some(error.to_string());
        if inner.db.consecutive_failures >= DEGRADED_AFTER_DB_FAILURES
            && inner.state == WorkerState::Running
        {
            inner.state = WorkerState::Degraded;
        }
    }

    /// First call wins; later calls keep the original reason.
    pub fn request_stop(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.stop_requested {
            return;
        }
        inner.stop_requested = true;
        inner.stop_reason = Some(reason.into());
        if inner.state != WorkerState::Stopped {
            inner.state = WorkerState::Draining;
        }
    }

    pub fn mark_stopped(&self) {
        self.lock().state = WorkerState::Stopped;
    }

    /// `/healthz`: the loop is alive and has ticked recently.
    pub fn liveness(&self) -> HealthSnapshot {
        let mut snap = self.snapshot();
        let silent = snap
            .last_loop_ago_seconds
            .is_some_and(|ago| ago > self.silence.as_secs_f64());
        let (ok, reason) = match snap.state {
            WorkerState::Stopped => (false, Some("stopped".to_string())),
            _ if silent => (false, Some("loop_silent".to_string())),
            _ => (true, None),
        };
        snap.ok = ok;
        snap.reason = reason;
        snap
    }

    /// `/readyz`: live, not draining, the database answers and the extra
    /// ready check (if any) passes.
    pub fn readiness(&self) -> HealthSnapshot {
        let mut snap = self.liveness();
        if !snap.ok {
            return snap;
        }
        let reason = match snap.state {
            WorkerState::Draining => Some("draining".to_string()),
            _ if !snap.db.ok => Some("db_unavailable".to_string()),
            _ => self.ready_check.as_ref().and_then(|check| check().err()),
        };
        if let Some(reason) = reason {
            snap.ok = false;
            snap.reason = Some(reason);
        }
        snap
    }

    fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            ok: true,
            reason: None,
            projection: self.projection,
            worker_id: self.worker_id.clone(),
            state: inner.state,
            stop_requested: inner.stop_requested,
            stop_reason: inner.stop_reason.clone(),
            last_loop_ago_seconds: inner.last_loop_at.map(|t| t.elapsed().as_secs_f64()),
            db: inner.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> WorkerHealth {
        WorkerHealth::new(Projection::Search, "w-1", Duration::from_secs(10))
    }

    #[test]
    fn degrades_after_three_db_failures_and_recovers() {
        let h = health();
        h.record_db_failure("connection refused");
        h.record_db_failure("connection refused");
        assert_eq!(h.state(), WorkerState::Running);
        h.record_db_failure("connection refused");
        assert_eq!(h.state(), WorkerState::Degraded);
        assert!(!h.readiness().ok);
        assert!(h.liveness().ok);

        h.record_db_ok();
        assert_eq!(h.state(), WorkerState::Running);
        assert!(h.readiness().ok);
    }

    #[test]
    fn stop_request_drains_and_keeps_first_reason() {
        let h = health();
        h.request_stop("SIGTERM");
        h.request_stop("SIGINT");
        let snap = h.readiness();
        assert_eq!(snap.state, WorkerState::Draining);
        assert_eq!(snap.stop_reason.as_deref(), Some("SIGTERM"));
        assert_eq!(snap.reason.as_deref(), Some("draining"));
        assert!(h.liveness().ok);

        h.mark_stopped();
        assert!(!h.liveness().ok);
    }

    #[test]
    fn ready_check_gates_readiness_only() {
        let open = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gate = open.clone();
        let h = health().with_ready_check(Arc::new(move || {
            if gate.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err("search sink warming up".to_string())
            }
        }));
        let snap = h.readiness();
        assert!(!snap.ok);
        assert_eq!(snap.reason.as_deref(), Some("search sink warming up"));
        assert!(h.liveness().ok);

        open.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(h.readiness().ok);
    }

    #[test]
    fn silent_loop_fails_liveness() {
        let h = WorkerHealth::new(Projection::Search, "w-1", Duration::ZERO);
        h.touch();
        std::thread::sleep(Duration::from_millis(5));
        let snap = h.liveness();
        assert!(!snap.ok);
        assert_eq!(snap.reason.as_deref(), Some("loop_silent"));
    }

    #[test]
    fn snapshot_serializes_state_upper_case() {
        let json = serde_json::to_value(health().liveness()).unwrap();
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["projection"], "search");
        assert_eq!(json["db"]["consecutive_failures"], 0);
    }
}
