//! HTTP handlers for staging, discarding, unlinking and serving attachments.
//! Object bodies are streamed from disk rather than buffered.

use crate::{
    errors::AppError,
    handlers::owner::OwnerId,
    services::{
        lifecycle::PickedFile,
        storage_path::{PUBLIC_URL_MARKER, StoragePath},
    },
    state::AppState,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
pub struct StageQuery {
    pub maintenance_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DiscardReq {
    pub url: String,
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_MIME.to_string())
}

/// POST `/vehicles/{vehicle_id}/attachments` - stage one upload from the raw body.
pub async fn stage_attachment(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(vehicle_id): Path<Uuid>,
    Query(query): Query<StageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let file = PickedFile {
        bytes: body,
        mime_type: content_type(&headers),
    };
    let stored = state
        .coordinator
        .stage_upload(owner, vehicle_id, query.maintenance_id, file)
        .await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

/// POST `/vehicles/{vehicle_id}/attachments/batch` - stage every part of a
/// multipart form, in form order.
pub async fn stage_attachments(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(vehicle_id): Path<Uuid>,
    Query(query): Query<StageQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        let mime_type = field
            .content_type()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_MIME.to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::bad_request(err.body_text()))?;
        files.push(PickedFile { bytes, mime_type });
    }
    if files.is_empty() {
        return Err(AppError::bad_request("no files in form"));
    }

    let stored = state
        .coordinator
        .stage_uploads(owner, vehicle_id, query.maintenance_id, files)
        .await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

/// DELETE `/attachments/staged` - drop an upload that was never linked.
pub async fn discard_staged(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Json(req): Json<DiscardReq>,
) -> Result<impl IntoResponse, AppError> {
    state.coordinator.discard_staged(owner, &req.url).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE `/attachments/{file_id}` - unlink one file and remove its object.
pub async fn remove_attachment(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(file_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.coordinator.remove_attachment(owner, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/storage/v1/object/public/{*path}` - stream a stored object.
///
/// Object keys are unguessable, so this route is public like the URLs it serves.
pub async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let path = StoragePath::parse(&path).ok_or_else(|| {
        AppError::not_found(format!("no object under {}{}", PUBLIC_URL_MARKER, path))
    })?;
    let file = state.store.open(&path).await?;
    let size = file.metadata().await.ok().map(|meta| meta.len());

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    let content_type = HeaderValue::from_str(path.content_type().as_ref())
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    Ok(response)
}
