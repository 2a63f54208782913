//! Defines routes for maintenance records and their attachments.
//!
//! ## Structure
//! - **Records**
//!   - `GET    /vehicles/{vehicle_id}/maintenance` - list a vehicle's records
//!   - `POST   /vehicles/{vehicle_id}/maintenance` - create with staged attachments
//!   - `GET    /maintenance/{id}` - record plus attachments
//!   - `PATCH  /maintenance/{id}` - update fields and attachment set
//!   - `DELETE /maintenance/{id}` - delete record, rows and objects
//!
//! - **Attachments**
//!   - `POST   /vehicles/{vehicle_id}/attachments` - stage one upload (raw body)
//!   - `POST   /vehicles/{vehicle_id}/attachments/batch` - stage a multipart form
//!   - `DELETE /attachments/staged` - discard an unlinked upload
//!   - `DELETE /attachments/{file_id}` - unlink one file
//!   - `GET    /storage/v1/object/public/{*path}` - download an object
//!
//! Everything except health and downloads requires the `x-owner-id` header.

use crate::{
    handlers::{
        attachment_handlers::{
            discard_staged, get_object, remove_attachment, stage_attachment, stage_attachments,
        },
        health_handlers::{healthz, readyz},
        maintenance_handlers::{
            create_maintenance, delete_maintenance, get_maintenance, list_maintenance,
            update_maintenance,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. Upload routes accept bodies up to `max_object_bytes`.
pub fn routes(max_object_bytes: usize) -> Router<AppState> {
    let uploads = Router::new()
        .route("/vehicles/{vehicle_id}/attachments", post(stage_attachment))
        .route(
            "/vehicles/{vehicle_id}/attachments/batch",
            post(stage_attachments),
        )
        .layer(DefaultBodyLimit::max(max_object_bytes.saturating_mul(4)));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/vehicles/{vehicle_id}/maintenance",
            get(list_maintenance).post(create_maintenance),
        )
        .route(
            "/maintenance/{id}",
            get(get_maintenance)
                .patch(update_maintenance)
                .delete(delete_maintenance),
        )
        .route("/attachments/staged", delete(discard_staged))
        .route("/attachments/{file_id}", delete(remove_attachment))
        .route("/storage/v1/object/public/{*path}", get(get_object))
        .merge(uploads)
}
