//! Daemon lifecycle: storage, server identity, engine, HTTP listeners

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use opendal::Operator;
use prometheus_client::registry::Registry;
use rdsync_core::config::RdsyncConfig;
use rdsync_core::ServerInfo;
use rdsync_storage::config_ext::{set_config_value, try_get_config_value};
use rdsync_storage::{OpendalAccessor, StorageAccessor};
use rdsync_sync::{BroadcastPublisher, FanoutPublisher, NotificationSink, SyncEngine, TracingPublisher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::SyncMetrics;
use crate::{files, notifications, synchronization};

/// Config entry holding the generated server id.
pub const SERVER_ID_CONFIG: &str = "server-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub operator: Operator,
    pub events: BroadcastPublisher,
    pub registry: Arc<Registry>,
    pub metrics: SyncMetrics,
    pub request_timeout: Duration,
    pub shutdown: CancellationToken,
}

/// Configured id, else the one persisted in storage, else a new uuid that
/// is persisted for the next start.
pub async fn resolve_server_id(storage: &dyn StorageAccessor, config: &RdsyncConfig) -> Result<String> {
    if let Some(id) = config.server.server_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if let Some(id) = try_get_config_value::<String>(storage, SERVER_ID_CONFIG).await? {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    set_config_value(storage, SERVER_ID_CONFIG, &id).await?;
    info!(server_id = %id, "generated server id");
    Ok(id)
}

async fn notifier(config: &RdsyncConfig, events: &BroadcastPublisher) -> Arc<dyn NotificationSink> {
    let fanout = FanoutPublisher::new()
        .with(Arc::new(events.clone()))
        .with(Arc::new(TracingPublisher));

    #[cfg(feature = "nats")]
    let fanout = match config.server.nats_url.as_deref() {
        Some(url) => match rdsync_sync::NatsPublisher::connect(url).await {
            Ok(nats) => {
                info!(url, "publishing synchronization updates to NATS");
                fanout.with(Arc::new(nats))
            }
            Err(e) => {
                warn!(url, "NATS unavailable, updates stay local: {e}");
                fanout
            }
        },
        None => fanout,
    };
    #[cfg(not(feature = "nats"))]
    if config.server.nats_url.is_some() {
        warn!("server.nats_url is set but rdsyncd was built without the nats feature");
    }

    Arc::new(fanout)
}

pub async fn build_state(config: &RdsyncConfig) -> Result<AppState> {
    let operator = rdsync_storage::build_operator(&config.storage).context("building storage operator")?;
    if let Err(e) = rdsync_storage::check_health(&operator).await {
        warn!(backend = %config.storage.backend, "storage not reachable yet: {e}");
    }
    let storage: Arc<dyn StorageAccessor> = Arc::new(OpendalAccessor::new(operator.clone()));

    let server = ServerInfo {
        url: config.server.url.trim_end_matches('/').to_string(),
        id: resolve_server_id(storage.as_ref(), config).await?,
    };
    info!(url = %server.url, server_id = %server.id, "server identity ready");

    let events = BroadcastPublisher::default();
    let notifier = notifier(config, &events).await;
    let engine = SyncEngine::new(storage, server, config, notifier).context("creating sync engine")?;

    let mut registry = Registry::default();
    let metrics = SyncMetrics::new(&mut registry);

    Ok(AppState {
        engine: Arc::new(engine),
        operator,
        events,
        registry: Arc::new(registry),
        metrics,
        request_timeout: Duration::from_secs(config.sync.request_timeout_secs.max(1)),
        shutdown: CancellationToken::new(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(files::router())
        .merge(synchronization::router())
        .merge(notifications::router())
        .merge(crate::metrics::router())
        // Pushes and uploads are whole files.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve until ctrl-c, then cancel running attempts.
pub async fn run(config: RdsyncConfig) -> Result<()> {
    info!("daemon starting");
    let state = build_state(&config).await?;

    if let Some(addr) = config.server.metrics_addr.clone() {
        let ops_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, ops_state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(addr = %config.server.listen, "http: listening");

    notify_ready();

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("waiting for ctrl-c failed: {e}");
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("http server")
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op otherwise.
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
