//! src/services/attachment_store.rs
//!
//! AttachmentStore - object storage for maintenance attachments. The trait is
//! the seam the lifecycle coordinator depends on; `LocalAttachmentStore`
//! keeps payloads on local disk beneath `base_path/{canonical key}` and
//! serves them under the public URL convention.

use crate::services::storage_path::StoragePath;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object payload is empty")]
    EmptyPayload,
    #[error("object of {size} bytes exceeds the {limit} byte limit")]
    QuotaExceeded { size: usize, limit: usize },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where a freshly uploaded object ended up.
///
/// The path is kept alongside the URL because removal is keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub url: String,
    pub path: StoragePath,
}

/// Outcome of a removal. A missing object is not an error so that removals
/// can be retried freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    Removed,
    NotFound,
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Write `bytes` under a new random key. Nothing is visible at the key
    /// unless the whole payload was written.
    async fn put(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        bytes: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredObject>;

    /// Remove the object at `path`. Idempotent.
    async fn remove(&self, path: &StoragePath) -> StorageResult<Removal>;

    /// Resolve a public URL back to its key, `None` for legacy or foreign URLs.
    fn path_from_url(&self, url: &str) -> Option<StoragePath> {
        StoragePath::from_url(url)
    }
}

/// Disk-backed attachment store.
#[derive(Clone, Debug)]
pub struct LocalAttachmentStore {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Public origin used to build object URLs.
    pub public_base_url: String,

    /// Largest payload accepted by `put`.
    pub max_object_bytes: usize,
}

impl LocalAttachmentStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        max_object_bytes: usize,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into(),
            max_object_bytes,
        }
    }

    /// Physical location of an object. Canonical keys contain no traversal
    /// segments, so joining is safe.
    fn object_path(&self, path: &StoragePath) -> PathBuf {
        self.base_path.join(path.to_string())
    }

    /// Open a stored object for streaming.
    pub async fn open(&self, path: &StoragePath) -> StorageResult<File> {
        File::open(self.object_path(path)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Write to a temp file beside the target, fsync, then rename into place.
    async fn write_atomically(&self, file_path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = create_file(&parent, &tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, file_path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the store root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Create `file_path` inside `parent`. A concurrent removal may prune `parent`
/// after it was created, so a missing directory is recreated once.
async fn create_file(parent: &Path, file_path: &Path) -> io::Result<File> {
    match File::create(file_path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(parent).await?;
            File::create(file_path).await
        }
        other => other,
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
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
        if bytes.len() > self.max_object_bytes {
            return Err(StorageError::QuotaExceeded {
                size: bytes.len(),
                limit: self.max_object_bytes,
            });
        }

        let path = StoragePath::generate(owner_id, vehicle_id, maintenance_id, mime_type);
        let file_path = self.object_path(&path);
        self.write_atomically(&file_path, &bytes).await?;
        debug!("stored object {} ({} bytes)", path, bytes.len());

        Ok(StoredObject {
            url: path.to_url(&self.public_base_url),
            path,
        })
    }

    #[instrument(skip(self, path), fields(path = %path))]
    async fn remove(&self, path: &StoragePath) -> StorageResult<Removal> {
        let file_path = self.object_path(path);
        let removal = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed physical file {}", file_path.display());
                Removal::Removed
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                Removal::NotFound
            }
            Err(err) => return Err(StorageError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }

        Ok(removal)
    }
}
