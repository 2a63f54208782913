//! HTTP handlers for maintenance records. Every operation is scoped to the
//! caller and delegated to the lifecycle coordinator.

use crate::{
    errors::AppError,
    handlers::owner::OwnerId,
    models::maintenance::{MaintenanceFields, MaintenancePatch},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body of `POST /vehicles/{vehicle_id}/maintenance`.
#[derive(Debug, Deserialize)]
pub struct CreateMaintenanceReq {
    #[serde(flatten)]
    pub fields: MaintenanceFields,
    /// URLs returned by the staging endpoints.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Body of `PATCH /maintenance/{id}`. Omit `attachments` to leave files alone.
#[derive(Debug, Deserialize)]
pub struct UpdateMaintenanceReq {
    #[serde(flatten)]
    pub patch: MaintenancePatch,
    pub attachments: Option<Vec<String>>,
}

/// GET `/vehicles/{vehicle_id}/maintenance`
pub async fn list_maintenance(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(vehicle_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let records = state.coordinator.list_for_vehicle(owner, vehicle_id).await?;
    Ok(Json(records))
}

/// POST `/vehicles/{vehicle_id}/maintenance`
pub async fn create_maintenance(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(vehicle_id): Path<Uuid>,
    Json(req): Json<CreateMaintenanceReq>,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .coordinator
        .create_with_attachments(owner, vehicle_id, &req.fields, &req.attachments)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET `/maintenance/{id}`
pub async fn get_maintenance(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.coordinator.get_with_attachments(owner, id).await?;
    Ok(Json(view))
}

/// PATCH `/maintenance/{id}`
pub async fn update_maintenance(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateMaintenanceReq>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .coordinator
        .update_with_attachments(owner, id, req.patch, req.attachments)
        .await?;
    Ok(Json(outcome))
}

/// DELETE `/maintenance/{id}`
pub async fn delete_maintenance(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.coordinator.delete_with_attachments(owner, id).await?;
    Ok(Json(outcome))
}
