//! `/healthz`, `/readyz` and `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::health::{HealthSnapshot, WorkerHealth};
use crate::telemetry::{MetricsSnapshot, OutboxMetrics};

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<WorkerHealth>,
    pub metrics: Arc<OutboxMetrics>,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Serialize)]
struct HealthBody {
    #[serde(flatten)]
    health: HealthSnapshot,
    counters: MetricsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn respond(health: HealthSnapshot, metrics: &OutboxMetrics) -> (StatusCode, Json<HealthBody>) {
    let status = if health.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthBody {
            health,
            counters: metrics.snapshot(),
        }),
    )
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.health.liveness(), &state.metrics)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.health.readiness(), &state.metrics)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wordloom_core::outbox::Projection;

    use super::*;

    fn state() -> AppState {
        AppState {
            health: Arc::new(WorkerHealth::new(
                Projection::Search,
                "w-1",
                Duration::from_secs(10),
            )),
            metrics: Arc::new(OutboxMetrics::new(Projection::Search)),
            prometheus: None,
        }
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthy_worker_is_ready() {
        let s = state();
        s.metrics.idempotent_noop("block");
        let (status, body) = get_json(router(s), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["worker_id"], "w-1");
        assert_eq!(
            body["counters"]["counters"]["outbox_idempotent_noop_total"],
            1
        );
    }

    #[tokio::test]
    async fn draining_worker_is_live_but_not_ready() {
        let s = state();
        s.health.request_stop("SIGTERM");
        let (status, body) = get_json(router(s.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["state"], "DRAINING");
        assert_eq!(body["stop_requested"], true);
        let (status, _) = get_json(router(s), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn failing_ready_check_is_not_ready() {
        let s = AppState {
            health: Arc::new(
                WorkerHealth::new(Projection::Search, "w-1", Duration::from_secs(10))
                    .with_ready_check(Arc::new(|| Err("elasticsearch unreachable".to_string()))),
            ),
            ..state()
        };
        let (status, body) = get_json(router(s.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "elasticsearch unreachable");
        let (status, _) = get_json(router(s), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_empty() {
        let resp = router(state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
