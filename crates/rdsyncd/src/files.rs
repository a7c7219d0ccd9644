//! Local file operations.
//!
//!   GET    /files                    live file names
//!   PUT    /files/{name}             upload; metadata from request headers
//!   GET    /files/{name}             content, metadata echoed as headers
//!   DELETE /files/{name}             delete, leaving a tombstone
//!   GET    /files/{name}/metadata    metadata as JSON
//!   POST   /files/{name}/metadata    replace user metadata from headers
//!   POST   /files/{name}/rename?to=  rename, leaving a tombstone

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rdsync_core::Metadata;
use rdsync_sync::multipart::{headers_to_metadata, metadata_to_headers};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files", get(list_files))
        .route(
            "/files/{name}",
            get(download).put(upload).delete(delete_file),
        )
        .route("/files/{name}/metadata", get(get_metadata).post(update_metadata))
        .route("/files/{name}/rename", post(rename))
}

async fn list_files(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.engine.files().list().await?))
}

async fn upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let metadata = headers_to_metadata(&headers);
    let stored = state.engine.files().upload(&name, &metadata, body).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn download(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    let (metadata, content) = state.engine.files().download(&name).await?;
    Ok((metadata_to_headers(&metadata)?, content))
}

async fn delete_file(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.engine.files().delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_metadata(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Metadata>> {
    Ok(Json(state.engine.files().live_metadata(&name).await?))
}

async fn update_metadata(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Metadata>> {
    let metadata = headers_to_metadata(&headers);
    Ok(Json(state.engine.files().update_metadata(&name, &metadata).await?))
}

#[derive(Deserialize)]
struct RenameQuery {
    to: String,
}

async fn rename(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RenameQuery>,
) -> ApiResult<Json<Metadata>> {
    if query.to.is_empty() {
        return Err(ApiError::bad_request("rename needs a target name"));
    }
    Ok(Json(state.engine.files().rename(&name, &query.to).await?))
}
