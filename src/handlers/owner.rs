//! Caller identity. Authentication happens upstream; the gateway forwards the
//! authenticated user id in `x-owner-id`.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const OWNER_HEADER: &str = "x-owner-id";

/// The authenticated user every query is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerId(pub Uuid);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing owner identity"))?;

        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(OwnerId)
            .ok_or_else(|| AppError::unauthorized("invalid owner identity"))
    }
}
