//! AttachmentLedger - the `maintenance_files` rows that associate stored
//! objects with maintenance records.
//!
//! A row is the source of truth for "this file belongs to this record".
//! Removal returns the storage path derived from the row's URL so the caller
//! can delete the physical object; rows whose URL does not follow the
//! canonical layout are logged and yield no path.

use crate::{
    models::attachment::AttachmentFile,
    services::{
        errors::{RepositoryError, RepositoryResult},
        storage_path::{PUBLIC_URL_MARKER, StoragePath},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait AttachmentLedger: Send + Sync {
    /// Link `url` to a record. Fails with `NotFound` unless the record exists
    /// and belongs to `owner_id`.
    async fn add(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
        url: &str,
    ) -> RepositoryResult<AttachmentFile>;

    /// Rows of a record, oldest upload first.
    async fn list(&self, maintenance_id: Uuid, owner_id: Uuid)
    -> RepositoryResult<Vec<AttachmentFile>>;

    /// Rows of any record of `owner_id` whose URL resolves to `path`, whatever
    /// base URL they were written with.
    async fn find_by_path(
        &self,
        owner_id: Uuid,
        path: &StoragePath,
    ) -> RepositoryResult<Vec<AttachmentFile>>;

    /// Delete one row and hand back the storage path of its object, if the
    /// URL resolves to one.
    async fn remove_by_id(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Option<StoragePath>>;

    /// Delete every row of a record, returning the resolvable paths.
    async fn remove_all_for_maintenance(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Vec<StoragePath>>;
}

#[derive(Clone, Debug)]
pub struct SqliteAttachmentLedger {
    pub db: Arc<SqlitePool>,
}

impl SqliteAttachmentLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

/// Resolve a ledger URL, logging rows that cannot be mapped to an object.
pub(crate) fn resolve_row_path(file_id: Uuid, url: &str) -> Option<StoragePath> {
    let path = StoragePath::from_url(url);
    if path.is_none() {
        warn!(%file_id, url, "attachment URL has no canonical storage path");
    }
    path
}

#[async_trait]
impl AttachmentLedger for SqliteAttachmentLedger {
    async fn add(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
        url: &str,
    ) -> RepositoryResult<AttachmentFile> {
        // The SELECT enforces that the record exists under the same owner.
        let row = sqlx::query_as::<_, AttachmentFile>(
            "INSERT INTO maintenance_files (id, maintenance_id, owner_id, file_url, uploaded_at)
             SELECT ?, id, owner_id, ?, ?
             FROM maintenance WHERE id = ? AND owner_id = ?
             RETURNING id, maintenance_id, owner_id, file_url, uploaded_at",
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .bind(Utc::now())
        .bind(maintenance_id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(RepositoryError::NotFound)?;

        debug!("linked {} to maintenance {}", row.file_url, maintenance_id);
        Ok(row)
    }

    async fn list(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Vec<AttachmentFile>> {
        let rows = sqlx::query_as::<_, AttachmentFile>(
            "SELECT id, maintenance_id, owner_id, file_url, uploaded_at
             FROM maintenance_files
             WHERE maintenance_id = ? AND owner_id = ?
             ORDER BY uploaded_at ASC, rowid ASC",
        )
        .bind(maintenance_id)
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn find_by_path(
        &self,
        owner_id: Uuid,
        path: &StoragePath,
    ) -> RepositoryResult<Vec<AttachmentFile>> {
        let needle = format!("{}{}", PUBLIC_URL_MARKER, path);
        let rows = sqlx::query_as::<_, AttachmentFile>(
            "SELECT id, maintenance_id, owner_id, file_url, uploaded_at
             FROM maintenance_files
             WHERE owner_id = ? AND instr(file_url, ?) > 0
             ORDER BY uploaded_at ASC, rowid ASC",
        )
        .bind(owner_id)
        .bind(needle)
        .fetch_all(&*self.db)
        .await?;

        // instr is a substring match; keep rows that resolve to exactly `path`.
        Ok(rows
            .into_iter()
            .filter(|row| StoragePath::from_url(&row.file_url).as_ref() == Some(path))
            .collect())
    }

    async fn remove_by_id(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Option<StoragePath>> {
        let url = sqlx::query_scalar::<_, String>(
            "DELETE FROM maintenance_files WHERE id = ? AND owner_id = ? RETURNING file_url",
        )
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(RepositoryError::NotFound)?;

        Ok(resolve_row_path(file_id, &url))
    }

    async fn remove_all_for_maintenance(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Vec<StoragePath>> {
        let removed = sqlx::query_as::<_, (Uuid, String)>(
            "DELETE FROM maintenance_files WHERE maintenance_id = ? AND owner_id = ?
             RETURNING id, file_url",
        )
        .bind(maintenance_id)
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?;

        debug!(
            "unlinked {} files from maintenance {}",
            removed.len(),
            maintenance_id
        );
        Ok(removed
            .iter()
            .filter_map(|(id, url)| resolve_row_path(*id, url))
            .collect())
    }
}
