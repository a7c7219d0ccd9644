//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  liveness (always 200 while the process runs)
//!   GET /readyz   readiness (200 if storage is reachable)
//!
//! The same routes are mounted on the main listener and, when
//! `server.metrics_addr` is set, served on their own address.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use rdsync_core::{SynchronizationDirection, SynchronizationReport};

use crate::server::AppState;

type Labels = Vec<(String, String)>;

/// Synchronization attempt counters, labelled by direction.
#[derive(Clone)]
pub struct SyncMetrics {
    started: Family<Labels, Counter>,
    completed: Family<Labels, Counter>,
    failed: Family<Labels, Counter>,
    conflicted: Family<Labels, Counter>,
    bytes_copied: Family<Labels, Counter>,
    bytes_transferred: Family<Labels, Counter>,
    duration: Family<Labels, Histogram>,
}

fn direction_labels(direction: SynchronizationDirection) -> Labels {
    vec![("direction".to_string(), direction.as_str().to_string())]
}

impl SyncMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = SyncMetrics {
            started: Family::default(),
            completed: Family::default(),
            failed: Family::default(),
            conflicted: Family::default(),
            bytes_copied: Family::default(),
            bytes_transferred: Family::default(),
            duration: Family::new_with_constructor(|| {
                Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
            }),
        };

        registry.register(
            "rdsync_sync_started",
            "Synchronization attempts started",
            metrics.started.clone(),
        );
        registry.register(
            "rdsync_sync_completed",
            "Synchronization attempts that completed",
            metrics.completed.clone(),
        );
        registry.register(
            "rdsync_sync_failed",
            "Synchronization attempts that failed",
            metrics.failed.clone(),
        );
        registry.register(
            "rdsync_sync_conflicted",
            "Synchronization attempts that ended in a conflict",
            metrics.conflicted.clone(),
        );
        registry.register(
            "rdsync_bytes_copied",
            "Bytes reused from the destination's copy",
            metrics.bytes_copied.clone(),
        );
        registry.register(
            "rdsync_bytes_transferred",
            "Bytes sent over the wire",
            metrics.bytes_transferred.clone(),
        );
        registry.register(
            "rdsync_sync_duration_seconds",
            "Synchronization attempt duration in seconds",
            metrics.duration.clone(),
        );
        metrics
    }

    pub fn started(&self, direction: SynchronizationDirection) {
        self.started.get_or_create(&direction_labels(direction)).inc();
    }

    pub fn finished(
        &self,
        direction: SynchronizationDirection,
        report: &SynchronizationReport,
        elapsed: Duration,
    ) {
        let labels = direction_labels(direction);
        let outcome = if report.is_conflicted() {
            &self.conflicted
        } else if report.is_success() {
            &self.completed
        } else {
            &self.failed
        };
        outcome.get_or_create(&labels).inc();
        self.bytes_copied
            .get_or_create(&labels)
            .inc_by(report.bytes_copied);
        self.bytes_transferred
            .get_or_create(&labels)
            .inc_by(report.bytes_transferred);
        self.duration
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
}

/// Serve the ops routes alone on `addr` (e.g. "127.0.0.1:9100").
pub async fn serve(addr: String, state: AppState) -> Result<()> {
    let app = router().with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

pub(crate) fn encode_registry(registry: &Arc<Registry>) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 200 if storage is reachable, 503 otherwise.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    match rdsync_storage::check_health(&state.operator).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::warn!("readiness check failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable")
        }
    }
}
