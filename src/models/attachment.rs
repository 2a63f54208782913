//! Represents a file attached to a maintenance record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A row of the `maintenance_files` ledger.
///
/// The row is what links a stored object to its record; the object itself
/// lives in the attachment store at the path derived from `file_url`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct AttachmentFile {
    pub id: Uuid,

    /// Record this file belongs to.
    pub maintenance_id: Uuid,

    /// Copy of the record owner, used to scope every ledger query.
    pub owner_id: Uuid,

    /// Public URL of the stored object.
    pub file_url: String,

    pub uploaded_at: DateTime<Utc>,
}
