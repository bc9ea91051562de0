use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::auth::constant_time_eq;
use super::{ApiError, AppState, PAGE_SIZE};
use crate::media::{MediaId, MediaRecord};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MediaPage {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub items: Vec<MediaRecord>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub(super) async fn lookup(state: &AppState, raw_id: &str) -> Result<MediaRecord, ApiError> {
    let id: MediaId = raw_id.parse().map_err(|_| ApiError::NotFound)?;
    state.repo.get(&id).await?.ok_or(ApiError::NotFound)
}

pub async fn list_media(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<MediaPage>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let items = state.repo.list_page(page, PAGE_SIZE).await?;
    let total = state.repo.count().await?;
    Ok(Json(MediaPage {
        page,
        per_page: PAGE_SIZE,
        total,
        items,
    }))
}

pub async fn media_info(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let total = state.repo.count().await?;
    Ok(Json(json!({ "total": total })))
}

/// Deletes the archived message first, then the record pointing at it.
pub async fn delete_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = lookup(&state, &media_id).await?;
    let worker = state.pool.next_worker();
    worker.delete_messages(&[record.message_id]).await?;
    state.repo.delete(&record.id).await?;
    info!(
        event = "media.deleted",
        media_id = %record.id,
        message_id = record.message_id,
        "media.deleted"
    );
    Ok(Json(json!({ "deleted": record.id })))
}

pub async fn thumbnail(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Result<Response, ApiError> {
    let record = lookup(&state, &media_id).await?;
    let bytes = state
        .pool
        .next_worker()
        .get_thumbnail(record.message_id)
        .await?;
    Ok((
        [
            (CONTENT_TYPE, "image/jpeg"),
            (CACHE_CONTROL, "public, max-age=86400"),
        ],
        bytes,
    )
        .into_response())
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let settings = &state.settings;
    let (Some(username), Some(password)) = (&settings.username, &settings.password) else {
        return Err(ApiError::Unauthorized);
    };
    let user_ok = constant_time_eq(&request.username, username);
    let pass_ok = constant_time_eq(&request.password, password);
    if !(user_ok & pass_ok) {
        return Err(ApiError::Unauthorized);
    }
    Ok(Json(json!({ "token": settings.api_token })))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
