//! In-memory doubles for exercising the lifecycle coordinator's failure paths.

use crate::{
    models::attachment::AttachmentFile,
    services::{
        attachment_ledger::{AttachmentLedger, SqliteAttachmentLedger},
        attachment_store::{AttachmentStore, Removal, StorageError, StorageResult, StoredObject},
        errors::{RepositoryError, RepositoryResult},
        storage_path::StoragePath,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use uuid::Uuid;

pub const TEST_BASE_URL: &str = "http://vault.test";

/// Attachment store keeping payloads in a map, with injectable removal
/// failures.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<StoragePath, Bytes>>,
    failing_removals: Mutex<HashSet<StoragePath>>,
    attempts: Mutex<Vec<StoragePath>>,
}

impl MemoryStore {
    pub fn contains(&self, url: &str) -> bool {
        StoragePath::from_url(url)
            .is_some_and(|path| self.objects.lock().unwrap().contains_key(&path))
    }

    /// Make every removal of `url`'s object fail.
    pub fn fail_removal_of(&self, url: &str) {
        let path = StoragePath::from_url(url).unwrap();
        self.failing_removals.lock().unwrap().insert(path);
    }

    /// Paths removed so far, failed attempts included.
    pub fn removal_attempts(&self) -> Vec<StoragePath> {
        self.attempts.lock().unwrap().clone()
    }

    /// Paths actually removed.
    pub fn removed(&self) -> Vec<StoragePath> {
        let failing = self.failing_removals.lock().unwrap();
        self.removal_attempts()
            .into_iter()
            .filter(|path| !failing.contains(path))
            .collect()
    }
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn put(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        bytes: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredObject> {
        if bytes.is_empty() {
            return Err(StorageError::EmptyPayload);
        }
        let path = StoragePath::generate(owner_id, vehicle_id, maintenance_id, mime_type);
        self.objects.lock().unwrap().insert(path.clone(), bytes);
        Ok(StoredObject {
            url: path.to_url(TEST_BASE_URL),
            path,
        })
    }

    async fn remove(&self, path: &StoragePath) -> StorageResult<Removal> {
        self.attempts.lock().unwrap().push(path.clone());
        if self.failing_removals.lock().unwrap().contains(path) {
            return Err(StorageError::Backend("injected removal failure".into()));
        }
        Ok(match self.objects.lock().unwrap().remove(path) {
            Some(_) => Removal::Removed,
            None => Removal::NotFound,
        })
    }
}

/// SQLite ledger with switches for failing individual operations.
pub struct FlakyLedger {
    pub inner: SqliteAttachmentLedger,
    failing_adds: Mutex<HashSet<String>>,
    fail_unlinks: AtomicBool,
    fail_bulk_removal: AtomicBool,
}

impl FlakyLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            inner: SqliteAttachmentLedger::new(db),
            failing_adds: Mutex::default(),
            fail_unlinks: AtomicBool::new(false),
            fail_bulk_removal: AtomicBool::new(false),
        }
    }

    pub fn fail_add_for(&self, url: &str) {
        self.failing_adds.lock().unwrap().insert(url.to_string());
    }

    pub fn fail_unlinks(&self) {
        self.fail_unlinks.store(true, Ordering::SeqCst);
    }

    pub fn fail_bulk_removal(&self) {
        self.fail_bulk_removal.store(true, Ordering::SeqCst);
    }
}

fn injected() -> RepositoryError {
    RepositoryError::Sqlx(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl AttachmentLedger for FlakyLedger {
    async fn add(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
        url: &str,
    ) -> RepositoryResult<AttachmentFile> {
        if self.failing_adds.lock().unwrap().contains(url) {
            return Err(injected());
        }
        self.inner.add(maintenance_id, owner_id, url).await
    }

    async fn list(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Vec<AttachmentFile>> {
        self.inner.list(maintenance_id, owner_id).await
    }

    async fn find_by_path(
        &self,
        owner_id: Uuid,
        path: &StoragePath,
    ) -> RepositoryResult<Vec<AttachmentFile>> {
        self.inner.find_by_path(owner_id, path).await
    }

    async fn remove_by_id(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Option<StoragePath>> {
        if self.fail_unlinks.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.remove_by_id(file_id, owner_id).await
    }

    async fn remove_all_for_maintenance(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
    ) -> RepositoryResult<Vec<StoragePath>> {
        if self.fail_bulk_removal.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner
            .remove_all_for_maintenance(maintenance_id, owner_id)
            .await
    }
}
