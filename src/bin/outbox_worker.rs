//! Lease-based outbox worker for one projection (`search` or `chronicle`).
//!
//! Configuration comes from the environment (see `WorkerConfig`); `.env` is
//! loaded first. SIGTERM and Ctrl+C stop claiming, let the batch in flight
//! finish within `WORDLOOM_OUTBOX_SHUTDOWN_DEADLINE_SECONDS`, then exit.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use wordloom::bootstrap::{connect_checked, load_dotenv};
use wordloom::http::{self, AppState};
use wordloom::telemetry::{init_logging, install_prometheus};
use wordloom::{ElasticsearchSink, FaultInjectingSink, OutboxMetrics, OutboxWorker, WorkerConfig, WorkerHealth};
use wordloom_core::ports::{Clock, NullSink, OutboxStore, SearchSink, SystemClock};
use wordloom_core::projector::{ChronicleProjector, Projector, SearchProjector};
use wordloom_core::Projection;
use wordloom_postgres::{PgChronicleStore, PgOutboxStore, PgSearchIndexStore, PgSourceReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    init_logging(config.log_format);

    let prometheus = match install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "prometheus recorder not installed; /metrics will be empty");
            None
        }
    };

    let pool = connect_checked(&config.database_url, &config.env, 10).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let source = Arc::new(PgSourceReader::new(pool.clone()));

    let projector: Arc<dyn Projector> = match config.projection {
        Projection::Search => {
            let sink: Arc<dyn SearchSink> = match &config.es_url {
                Some(url) => Arc::new(ElasticsearchSink::new(url.as_str(), config.es_index.as_str())?),
                None => {
                    info!("WORDLOOM_SEARCH_ES_URL not set; search writes go to search_index only");
                    Arc::new(NullSink)
                }
            };
            if config.faults.is_active() {
                warn!(faults = ?config.faults, "fault injection enabled on the search sink");
            }
            let sink = FaultInjectingSink::wrap(sink, config.faults.clone());
            Arc::new(
                SearchProjector::new(
                    Arc::new(PgSearchIndexStore::new(pool.clone())),
                    source,
                    sink,
                    clock.clone(),
                )
                .with_missing_source_limit(config.missing_source_max_attempts),
            )
        }
        Projection::Chronicle => Arc::new(
            ChronicleProjector::new(Arc::new(PgChronicleStore::new(pool.clone())), source, clock.clone())
                .with_missing_source_limit(config.missing_source_max_attempts),
        ),
        Projection::Basement => anyhow::bail!("basement is projected in-transaction and has no outbox"),
    };
    let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone(), config.projection)?);

    let metrics = Arc::new(OutboxMetrics::new(config.projection));
    let health = Arc::new(WorkerHealth::new(
        config.projection,
        config.worker.worker_id.clone(),
        config.health_silence,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let state = AppState {
        health: health.clone(),
        metrics: metrics.clone(),
        prometheus,
    };
    let server = tokio::spawn(http::serve(addr, state, shutdown_rx.clone()));

    let span = info_span!(
        "outbox_worker",
        service = %config.service_name,
        projection = config.projection.as_str(),
        worker_id = %config.worker.worker_id,
    );
    let worker = Arc::new(OutboxWorker::new(
        outbox,
        projector,
        config.worker.clone(),
        metrics,
        health.clone(),
        clock,
    ));
    let mut worker_task = {
        let worker = worker.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(rx).await }.instrument(span))
    };

    tokio::select! {
        joined = &mut worker_task => {
            if let Err(e) = joined {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        reason = shutdown_signal() => {
            info!(reason, deadline_secs = config.shutdown_deadline.as_secs(), "shutdown requested; draining");
            health.request_stop(reason);
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(config.shutdown_deadline, &mut worker_task).await {
                Ok(Ok(())) => info!("worker drained"),
                Ok(Err(e)) => error!(error = %e, "worker task ended abnormally"),
                Err(_) => {
                    warn!("shutdown deadline exceeded; abandoning batch in flight, leases will expire");
                    worker_task.abort();
                    health.mark_stopped();
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "health server failed"),
        Err(e) => error!(error = %e, "health server task panicked"),
    }
    pool.close().await;
    info!("outbox worker exited");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
