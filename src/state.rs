//! Shared state handed to every handler.

use crate::services::{
    attachment_ledger::SqliteAttachmentLedger, attachment_store::LocalAttachmentStore,
    lifecycle::LifecycleCoordinator, maintenance_repository::SqliteMaintenanceRepository,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: LifecycleCoordinator,
    /// Concrete store, for streaming objects and readiness checks.
    pub store: Arc<LocalAttachmentStore>,
    pub db: Arc<SqlitePool>,
}

impl AppState {
    /// Wire the SQLite repositories and the disk store into a coordinator.
    pub fn new(db: Arc<SqlitePool>, store: LocalAttachmentStore, upload_concurrency: usize) -> Self {
        let store = Arc::new(store);
        let coordinator = LifecycleCoordinator::new(
            store.clone(),
            Arc::new(SqliteMaintenanceRepository::new(db.clone())),
            Arc::new(SqliteAttachmentLedger::new(db.clone())),
        )
        .with_upload_concurrency(upload_concurrency);

        Self {
            coordinator,
            store,
            db,
        }
    }
}
