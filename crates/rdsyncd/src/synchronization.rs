//! Synchronization endpoints, both the operator-facing ones and the ones a
//! peer calls while pushing a file here.

use std::future::Future;
use std::time::Instant;

use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rdsync_core::{
    ConflictItem, ConflictResolutionStrategy, Metadata, SynchronizationDirection, SynchronizationReport,
};
use rdsync_sync::multipart::{headers_to_metadata, parse_file_name, parse_server_info};
use rdsync_sync::destination::detached;
use rdsync_sync::{ActiveSync, HttpDestination};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::parts::MultipartParts;
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/synchronization/start", post(start))
        .route("/synchronization/MultipartProceed", post(multipart_proceed))
        .route("/synchronization/UpdateMetadata", post(update_metadata))
        .route("/synchronization/rename", post(rename))
        .route("/synchronization/delete", post(delete))
        .route("/synchronization/metadata", get(metadata))
        .route("/synchronization/ResolveConflict", post(resolve_conflict))
        .route("/synchronization/ApplyConflict", post(apply_conflict))
        .route("/synchronization/finished", get(finished))
        .route("/synchronization/active", get(active))
        .route("/synchronization/conflicts", get(conflicts))
        .route("/rdc/signature", get(signature))
        .route("/config", get(config))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    file_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartQuery {
    file_name: String,
    destination: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveQuery {
    file_name: String,
    strategy: String,
    remote_server_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyQuery {
    file_name: String,
    remote_version: u64,
    remote_server_id: String,
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_take")]
    take: usize,
}

fn default_take() -> usize {
    25
}

/// Push `fileName` from this server to `destination`.
async fn start(State(state): State<AppState>, Query(query): Query<StartQuery>) -> ApiResult<Json<SynchronizationReport>> {
    let destination = HttpDestination::new(&query.destination, state.request_timeout)?;
    let direction = SynchronizationDirection::Outgoing;
    state.metrics.started(direction);
    let started = Instant::now();

    let cancel = state.shutdown.child_token();
    let report = state
        .engine
        .synchronize_to(&query.file_name, &destination, &cancel)
        .await;

    state.metrics.finished(direction, &report, started.elapsed());
    Ok(Json(report))
}

/// Identity, file name and metadata a peer sends with every push.
fn push_headers(headers: &HeaderMap) -> ApiResult<(rdsync_core::ServerInfo, String, Metadata)> {
    let source = parse_server_info(headers)?;
    let file = parse_file_name(headers)?;
    Ok((source, file, headers_to_metadata(headers)))
}

/// Run an incoming push detached from the request, so a dropped connection
/// cannot cut its commit short.
async fn apply_incoming<F>(state: &AppState, apply: F) -> ApiResult<Json<SynchronizationReport>>
where
    F: Future<Output = SynchronizationReport> + Send + 'static,
{
    let direction = SynchronizationDirection::Incoming;
    state.metrics.started(direction);
    let started = Instant::now();
    let metrics = state.metrics.clone();
    let report = detached(async move {
        let report = apply.await;
        metrics.finished(direction, &report, started.elapsed());
        report
    })
    .await?;
    Ok(Json(report))
}

async fn multipart_proceed(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<SynchronizationReport>> {
    let (source, file, metadata) = push_headers(&headers)?;
    debug!(file = %file, source = %source.url, "content push received");
    let engine = state.engine.clone();
    let mut parts = MultipartParts::new(multipart);
    apply_incoming(&state, async move {
        engine.incoming_content(&source, &file, &metadata, &mut parts).await
    })
    .await
}

async fn update_metadata(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<SynchronizationReport>> {
    let (source, file, metadata) = push_headers(&headers)?;
    let engine = state.engine.clone();
    apply_incoming(&state, async move { engine.incoming_metadata(&source, &file, &metadata).await }).await
}

async fn rename(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<SynchronizationReport>> {
    let (source, file, metadata) = push_headers(&headers)?;
    let engine = state.engine.clone();
    apply_incoming(&state, async move { engine.incoming_rename(&source, &file, &metadata).await }).await
}

async fn delete(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<SynchronizationReport>> {
    let (source, file, metadata) = push_headers(&headers)?;
    let engine = state.engine.clone();
    apply_incoming(&state, async move { engine.incoming_delete(&source, &file, &metadata).await }).await
}

/// Raw metadata, tombstones included; 404 when the file was never seen.
async fn metadata(State(state): State<AppState>, Query(query): Query<FileQuery>) -> ApiResult<Json<Metadata>> {
    state
        .engine
        .metadata(&query.file_name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("file not found: {}", query.file_name)))
}

async fn signature(State(state): State<AppState>, Query(query): Query<FileQuery>) -> ApiResult<impl IntoResponse> {
    let signature = state.engine.local_signature(&query.file_name).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], signature))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ConflictItem>> {
    let strategy: ConflictResolutionStrategy = query.strategy.parse()?;
    let item = state
        .engine
        .resolve_conflict(&query.file_name, strategy, query.remote_server_url.as_deref())
        .await?;
    info!(file = %query.file_name, strategy = ?strategy, "conflict resolved by operator");
    Ok(Json(item))
}

async fn apply_conflict(State(state): State<AppState>, Query(query): Query<ApplyQuery>) -> ApiResult<Json<ConflictItem>> {
    let item = state
        .engine
        .apply_conflict(&query.file_name, query.remote_version, &query.remote_server_id)
        .await?;
    Ok(Json(item))
}

async fn finished(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<SynchronizationReport>>> {
    Ok(Json(state.engine.finished(page.skip, page.take).await?))
}

async fn active(State(state): State<AppState>) -> Json<Vec<ActiveSync>> {
    Json(state.engine.active())
}

async fn conflicts(State(state): State<AppState>, Query(page): Query<PageQuery>) -> ApiResult<Json<Vec<ConflictItem>>> {
    Ok(Json(state.engine.conflicts(page.skip, page.take).await?))
}

#[derive(Deserialize)]
struct ConfigQuery {
    name: String,
}

async fn config(
    State(state): State<AppState>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Json<rdsync_storage::ConfigMap>> {
    state
        .engine
        .storage()
        .get_config(&query.name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("config not found: {}", query.name)))
}
