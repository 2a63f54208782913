//! src/services/lifecycle.rs
//!
//! LifecycleCoordinator - keeps a maintenance record, its ledger rows and the
//! stored objects consistent across create, update and delete.
//!
//! The relational store and the object store share no transaction. Each
//! operation is a saga: a fixed sequence of [`Step`]s, each with a declared
//! [`Policy`] for what happens when it fails.
//!
//! | operation | steps |
//! |-----------|-------|
//! | create    | `CreateRecord` → `RegisterFile` |
//! | update    | `LoadRecord` → `LoadLedger` → `DetachFile` → `RegisterFile` → `PatchRecord` → `RemoveObject` |
//! | delete    | `LoadRecord` → `LoadLedger` → `RemoveObject` → `UnlinkAll` → `DeleteRecord` |
//!
//! Constructive steps propagate their errors. Destructive steps are best
//! effort: a failed object removal leaves an orphan in the store (logged with
//! its path) but never keeps a ledger row or record alive that the user asked
//! to drop.

use crate::{
    models::{
        attachment::AttachmentFile,
        maintenance::{MaintenanceFields, MaintenancePatch, MaintenanceRecord},
    },
    services::{
        attachment_ledger::AttachmentLedger,
        attachment_store::{AttachmentStore, Removal, StorageError, StoredObject},
        errors::{FailedFile, LifecycleError, LifecycleResult, PartialFailure, RepositoryError},
        legacy::{AttachmentView, attachment_view, legacy_url},
        maintenance_repository::MaintenanceRepository,
        storage_path::StoragePath,
    },
};
use bytes::Bytes;
use futures::{StreamExt, future::join_all, stream};
use serde::Serialize;
use std::{collections::HashSet, fmt, future::Future, sync::Arc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// A unit of work inside a lifecycle saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadRecord,
    LoadLedger,
    CreateRecord,
    /// Link an already uploaded object to the record.
    RegisterFile,
    /// Remove a dropped file's object, then its ledger row.
    DetachFile,
    RemoveObject,
    UnlinkAll,
    PatchRecord,
    DeleteRecord,
}

/// What a failed step does to the rest of its saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The error ends the operation and reaches the caller.
    Abort,
    /// Every item is attempted; failures are gathered into a `PartialFailure`.
    Collect,
    /// The error is logged and the operation carries on.
    BestEffort,
}

impl Step {
    pub const fn policy(self) -> Policy {
        match self {
            Step::LoadRecord
            | Step::LoadLedger
            | Step::CreateRecord
            | Step::PatchRecord
            | Step::DeleteRecord => Policy::Abort,
            Step::RegisterFile => Policy::Collect,
            Step::DetachFile | Step::RemoveObject | Step::UnlinkAll => Policy::BestEffort,
        }
    }
}

pub const CREATE_STEPS: [Step; 2] = [Step::CreateRecord, Step::RegisterFile];

pub const UPDATE_STEPS: [Step; 6] = [
    Step::LoadRecord,
    Step::LoadLedger,
    Step::DetachFile,
    Step::RegisterFile,
    Step::PatchRecord,
    Step::RemoveObject,
];

pub const DELETE_STEPS: [Step; 5] = [
    Step::LoadRecord,
    Step::LoadLedger,
    Step::RemoveObject,
    Step::UnlinkAll,
    Step::DeleteRecord,
];

/// Progress through one saga run. Steps may be skipped, never reordered.
#[derive(Debug)]
struct Saga {
    operation: &'static str,
    steps: &'static [Step],
    cursor: usize,
    maintenance_id: Option<Uuid>,
}

impl Saga {
    fn new(operation: &'static str, steps: &'static [Step], maintenance_id: Option<Uuid>) -> Self {
        Self {
            operation,
            steps,
            cursor: 0,
            maintenance_id,
        }
    }

    fn enter(&mut self, step: Step) {
        let position = self.steps[self.cursor..]
            .iter()
            .position(|candidate| *candidate == step)
            .map(|offset| self.cursor + offset);
        debug_assert!(
            position.is_some(),
            "{} saga entered {:?} out of order",
            self.operation,
            step
        );
        if let Some(position) = position {
            self.cursor = position;
        }
        debug!(
            operation = self.operation,
            maintenance_id = ?self.maintenance_id,
            step = ?step,
            "saga step"
        );
    }

    async fn abort_on_failure<T, E, F>(&mut self, step: Step, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        debug_assert_eq!(step.policy(), Policy::Abort);
        self.enter(step);
        fut.await.inspect_err(|err| {
            warn!(
                operation = self.operation,
                maintenance_id = ?self.maintenance_id,
                step = ?step,
                error = %err,
                "saga step failed, aborting"
            );
        })
    }

    /// Run a best-effort action; `None` means it failed and was logged.
    async fn best_effort<T, E, F, S>(&self, step: Step, subject: S, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
        S: fmt::Display,
    {
        debug_assert_eq!(step.policy(), Policy::BestEffort);
        match fut.await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    operation = self.operation,
                    maintenance_id = ?self.maintenance_id,
                    step = ?step,
                    subject = %subject,
                    error = %err,
                    "best-effort step failed, continuing"
                );
                None
            }
        }
    }
}

/// Raw bytes handed over by the file picker.
#[derive(Debug, Clone)]
pub struct PickedFile {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// A record together with its attachment list.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceView {
    pub record: MaintenanceRecord,
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub record: MaintenanceRecord,
    pub attachments: Vec<AttachmentView>,
    /// Ledger rows the caller dropped but that could not be unlinked.
    pub still_linked: Vec<Uuid>,
    /// Objects whose physical removal failed.
    pub orphaned: Vec<StoragePath>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub removed_objects: usize,
    pub orphaned: Vec<StoragePath>,
    /// Ledger rows whose URL did not resolve to an owned storage path.
    pub unresolvable: usize,
}

/// Result of detaching one ledger row during update.
struct Detached {
    row_id: Uuid,
    unlinked: bool,
    orphan: Option<StoragePath>,
}

/// Orchestrates the maintenance record, attachment ledger and attachment
/// store. The collaborators are injected so they can be swapped for fakes.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    store: Arc<dyn AttachmentStore>,
    records: Arc<dyn MaintenanceRepository>,
    ledger: Arc<dyn AttachmentLedger>,
    upload_concurrency: usize,
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("upload_concurrency", &self.upload_concurrency)
            .finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        records: Arc<dyn MaintenanceRepository>,
        ledger: Arc<dyn AttachmentLedger>,
    ) -> Self {
        Self {
            store,
            records,
            ledger,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    /// Cap on uploads in flight within one `stage_uploads` call.
    pub fn with_upload_concurrency(mut self, limit: usize) -> Self {
        self.upload_concurrency = limit.max(1);
        self
    }

    pub async fn list_for_vehicle(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
    ) -> LifecycleResult<Vec<MaintenanceRecord>> {
        Ok(self.records.list_for_vehicle(owner_id, vehicle_id).await?)
    }

    /// The record plus its attachments, including a legacy entry when the
    /// ledger is empty.
    pub async fn get_with_attachments(
        &self,
        owner_id: Uuid,
        id: Uuid,
    ) -> LifecycleResult<MaintenanceView> {
        let record = self.records.get(owner_id, id).await?;
        let rows = self.ledger.list(id, owner_id).await?;
        Ok(MaintenanceView {
            attachments: attachment_view(&record, &rows),
            record,
        })
    }

    /// Upload one picked file ahead of saving its record.
    pub async fn stage_upload(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        file: PickedFile,
    ) -> LifecycleResult<StoredObject> {
        let mut stored = self
            .stage_uploads(owner_id, vehicle_id, maintenance_id, vec![file])
            .await?;
        stored
            .pop()
            .ok_or_else(|| LifecycleError::Validation("no file was uploaded".into()))
    }

    /// Upload several picked files with at most `upload_concurrency` in
    /// flight. Results keep input order. When only some uploads succeed the
    /// error lists the stored URLs so they are not uploaded twice.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn stage_uploads(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        files: Vec<PickedFile>,
    ) -> LifecycleResult<Vec<StoredObject>> {
        if let Some(id) = maintenance_id {
            self.record_for_vehicle(owner_id, id, vehicle_id).await?;
        }

        let store = &self.store;
        let results: Vec<Result<StoredObject, StorageError>> = stream::iter(files)
            .map(move |file| async move {
                store
                    .put(owner_id, vehicle_id, maintenance_id, file.bytes, &file.mime_type)
                    .await
            })
            .buffered(self.upload_concurrency)
            .collect()
            .await;

        let mut stored = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(object) => stored.push(object),
                Err(err) => {
                    warn!(index, error = %err, "staged upload failed");
                    failed.push(FailedFile {
                        file: index.to_string(),
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            None => Ok(stored),
            Some(err) if stored.is_empty() => Err(err.into()),
            Some(_) => Err(LifecycleError::PartialFailure(Box::new(PartialFailure {
                maintenance_id,
                succeeded: stored.into_iter().map(|object| object.url).collect(),
                failed,
            }))),
        }
    }

    /// Delete an upload the user dropped before it was linked to a record.
    pub async fn discard_staged(&self, owner_id: Uuid, url: &str) -> LifecycleResult<Removal> {
        let path = self
            .store
            .path_from_url(url)
            .ok_or_else(|| LifecycleError::Validation("not an attachment URL".into()))?;
        if path.owner_id() != owner_id {
            return Err(LifecycleError::NotFound);
        }

        if !self.ledger.find_by_path(owner_id, &path).await?.is_empty() {
            return Err(LifecycleError::Validation(
                "attachment is linked to a record; remove it from the record instead".into(),
            ));
        }

        let removal = self.store.remove(&path).await?;
        debug!(%path, ?removal, "discarded staged upload");
        Ok(removal)
    }

    /// Create a record and link the already uploaded `staged_urls` to it.
    ///
    /// A registration failure does not roll the record back: the error is a
    /// `PartialFailure` carrying the new record id, and the unregistered
    /// objects stay in the store.
    #[instrument(skip(self, fields, staged_urls), fields(files = staged_urls.len()))]
    pub async fn create_with_attachments(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        fields: &MaintenanceFields,
        staged_urls: &[String],
    ) -> LifecycleResult<MaintenanceView> {
        let new = fields.validate().map_err(LifecycleError::Validation)?;
        let staged = self
            .check_new_urls(owner_id, vehicle_id, None, staged_urls)
            .await?;

        let mut saga = Saga::new("create", &CREATE_STEPS, None);
        let record = saga
            .abort_on_failure(
                Step::CreateRecord,
                self.records.create(owner_id, vehicle_id, &new),
            )
            .await?;
        saga.maintenance_id = Some(record.id);

        saga.enter(Step::RegisterFile);
        let (rows, failed) = self.register_files(record.id, owner_id, &staged).await;
        if !failed.is_empty() {
            return Err(LifecycleError::PartialFailure(Box::new(PartialFailure {
                maintenance_id: Some(record.id),
                succeeded: rows.into_iter().map(|row| row.file_url).collect(),
                failed,
            })));
        }

        info!(maintenance_id = %record.id, files = rows.len(), "created maintenance");
        Ok(MaintenanceView {
            attachments: attachment_view(&record, &rows),
            record,
        })
    }

    /// Bring a record's attachments to `desired_urls` and apply `patch`.
    ///
    /// `None` leaves the attachments alone. Dropped files are detached best
    /// effort; new files must all register before the patch is written, so
    /// a failure there leaves the record's fields untouched.
    #[instrument(skip(self, patch, desired_urls))]
    pub async fn update_with_attachments(
        &self,
        owner_id: Uuid,
        id: Uuid,
        mut patch: MaintenancePatch,
        desired_urls: Option<Vec<String>>,
    ) -> LifecycleResult<UpdateOutcome> {
        patch.validate().map_err(LifecycleError::Validation)?;

        let mut saga = Saga::new("update", &UPDATE_STEPS, Some(id));
        let record = saga
            .abort_on_failure(Step::LoadRecord, self.records.get(owner_id, id))
            .await?;
        let current = saga
            .abort_on_failure(Step::LoadLedger, self.ledger.list(id, owner_id))
            .await?;

        let (removed, added) = match &desired_urls {
            Some(desired) => diff_attachments(&current, desired),
            None => (Vec::new(), Vec::new()),
        };
        let added = self
            .check_new_urls(owner_id, record.vehicle_id, Some(id), &added)
            .await?;

        saga.enter(Step::DetachFile);
        let detached =
            join_all(removed.iter().map(|row| self.detach(&saga, owner_id, row))).await;

        let mut still_linked = Vec::new();
        let mut orphaned = Vec::new();
        let mut unlinked = HashSet::new();
        for outcome in detached {
            if outcome.unlinked {
                unlinked.insert(outcome.row_id);
            } else {
                still_linked.push(outcome.row_id);
            }
            orphaned.extend(outcome.orphan);
        }

        saga.enter(Step::RegisterFile);
        let (registered, failed) = self.register_files(id, owner_id, &added).await;
        if !failed.is_empty() {
            return Err(LifecycleError::PartialFailure(Box::new(PartialFailure {
                maintenance_id: Some(id),
                succeeded: registered.into_iter().map(|row| row.file_url).collect(),
                failed,
            })));
        }

        let updated = saga
            .abort_on_failure(Step::PatchRecord, self.records.update(owner_id, id, &patch))
            .await?;

        if patch.clears_legacy_attachment() {
            if let Some(path) = legacy_url(&record).and_then(|url| self.owned_path(owner_id, url)) {
                saga.enter(Step::RemoveObject);
                let removed = saga
                    .best_effort(Step::RemoveObject, &path, self.store.remove(&path))
                    .await;
                if removed.is_none() {
                    orphaned.push(path);
                }
            }
        }

        let mut rows: Vec<AttachmentFile> = current
            .into_iter()
            .filter(|row| !unlinked.contains(&row.id))
            .collect();
        rows.extend(registered);

        info!(
            maintenance_id = %id,
            detached = unlinked.len(),
            added = added.len(),
            orphaned = orphaned.len(),
            "updated maintenance"
        );
        Ok(UpdateOutcome {
            attachments: attachment_view(&updated, &rows),
            record: updated,
            still_linked,
            orphaned,
        })
    }

    /// Unlink one attachment and remove its object best effort.
    #[instrument(skip(self))]
    pub async fn remove_attachment(&self, owner_id: Uuid, file_id: Uuid) -> LifecycleResult<()> {
        let path = self.ledger.remove_by_id(file_id, owner_id).await?;
        match path.filter(|path| path.owner_id() == owner_id) {
            Some(path) => {
                if let Err(err) = self.store.remove(&path).await {
                    warn!(%file_id, %path, error = %err, "object left behind after unlink");
                }
            }
            None => warn!(%file_id, "unlinked attachment had no owned storage path"),
        }
        Ok(())
    }

    /// Delete a record, its ledger rows and their objects.
    ///
    /// Object removals run independently and their failures only produce
    /// orphans; the ledger rows and the record are deleted regardless.
    #[instrument(skip(self))]
    pub async fn delete_with_attachments(
        &self,
        owner_id: Uuid,
        id: Uuid,
    ) -> LifecycleResult<DeleteOutcome> {
        let mut saga = Saga::new("delete", &DELETE_STEPS, Some(id));
        let record = saga
            .abort_on_failure(Step::LoadRecord, self.records.get(owner_id, id))
            .await?;
        let rows = saga
            .abort_on_failure(Step::LoadLedger, self.ledger.list(id, owner_id))
            .await?;

        let mut outcome = DeleteOutcome::default();
        let mut paths = Vec::with_capacity(rows.len() + 1);
        for row in &rows {
            match self.owned_path(owner_id, &row.file_url) {
                Some(path) => paths.push(path),
                None => outcome.unresolvable += 1,
            }
        }
        if let Some(path) = legacy_url(&record).and_then(|url| self.owned_path(owner_id, url)) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        saga.enter(Step::RemoveObject);
        let removals = join_all(
            paths
                .iter()
                .map(|path| saga.best_effort(Step::RemoveObject, path, self.store.remove(path))),
        )
        .await;
        for (path, removal) in paths.into_iter().zip(removals) {
            match removal {
                Some(Removal::Removed) => outcome.removed_objects += 1,
                Some(Removal::NotFound) => {}
                None => outcome.orphaned.push(path),
            }
        }

        saga.enter(Step::UnlinkAll);
        saga.best_effort(
            Step::UnlinkAll,
            id,
            self.ledger.remove_all_for_maintenance(id, owner_id),
        )
        .await;

        saga.abort_on_failure(Step::DeleteRecord, self.records.delete(owner_id, id))
            .await?;

        info!(
            maintenance_id = %id,
            removed = outcome.removed_objects,
            orphaned = outcome.orphaned.len(),
            unresolvable = outcome.unresolvable,
            "deleted maintenance"
        );
        Ok(outcome)
    }

    /// Fetch a record and make sure it belongs to `vehicle_id`.
    async fn record_for_vehicle(
        &self,
        owner_id: Uuid,
        id: Uuid,
        vehicle_id: Uuid,
    ) -> LifecycleResult<MaintenanceRecord> {
        let record = self.records.get(owner_id, id).await?;
        if record.vehicle_id != vehicle_id {
            return Err(LifecycleError::Validation(
                "maintenance record belongs to another vehicle".into(),
            ));
        }
        Ok(record)
    }

    /// Storage path of `url` if it is canonical and inside the owner's tree.
    fn owned_path(&self, owner_id: Uuid, url: &str) -> Option<StoragePath> {
        match self.store.path_from_url(url) {
            Some(path) if path.owner_id() == owner_id => Some(path),
            Some(path) => {
                warn!(%path, "attachment points into another owner's tree, skipping");
                None
            }
            None => {
                warn!(url, "attachment URL has no canonical storage path, skipping");
                None
            }
        }
    }

    /// Check URLs about to be linked: canonical, owned by the caller, under
    /// the right vehicle and (optionally) record, and not linked to any other
    /// record yet. Duplicates are dropped.
    async fn check_new_urls(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        maintenance_id: Option<Uuid>,
        urls: &[String],
    ) -> LifecycleResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut checked = Vec::with_capacity(urls.len());
        for url in urls {
            let path = self.store.path_from_url(url).ok_or_else(|| {
                LifecycleError::Validation(format!("`{}` is not an attachment URL", url))
            })?;
            let same_record =
                path.maintenance_id().is_none() || path.maintenance_id() == maintenance_id;
            if path.owner_id() != owner_id || path.vehicle_id() != vehicle_id || !same_record {
                return Err(LifecycleError::Validation(format!(
                    "`{}` was not uploaded for this maintenance record",
                    url
                )));
            }
            let linked_elsewhere = self
                .ledger
                .find_by_path(owner_id, &path)
                .await?
                .iter()
                .any(|row| Some(row.maintenance_id) != maintenance_id);
            if linked_elsewhere {
                return Err(LifecycleError::Validation(format!(
                    "`{}` is already linked to another maintenance record",
                    url
                )));
            }
            if seen.insert(path) {
                checked.push(url.clone());
            }
        }
        Ok(checked)
    }

    /// Register files one at a time so ledger order follows input order.
    async fn register_files(
        &self,
        maintenance_id: Uuid,
        owner_id: Uuid,
        urls: &[String],
    ) -> (Vec<AttachmentFile>, Vec<FailedFile>) {
        let mut rows = Vec::with_capacity(urls.len());
        let mut failed = Vec::new();
        for url in urls {
            match self.ledger.add(maintenance_id, owner_id, url).await {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(%maintenance_id, url, error = %err, "registration failed, object left unlinked");
                    failed.push(FailedFile {
                        file: url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        (rows, failed)
    }

    /// Remove a dropped file's object, then its ledger row whatever the
    /// removal outcome was.
    async fn detach(&self, saga: &Saga, owner_id: Uuid, row: &AttachmentFile) -> Detached {
        let mut orphan = None;
        if let Some(path) = self.owned_path(owner_id, &row.file_url) {
            let removed = saga
                .best_effort(Step::DetachFile, &path, self.store.remove(&path))
                .await;
            if removed.is_none() {
                orphan = Some(path);
            }
        }

        let unlink = async {
            match self.ledger.remove_by_id(row.id, owner_id).await {
                Err(RepositoryError::NotFound) => Ok(None),
                other => other,
            }
        };
        let unlinked = saga
            .best_effort(Step::DetachFile, row.id, unlink)
            .await
            .is_some();

        Detached {
            row_id: row.id,
            unlinked,
            orphan,
        }
    }
}

/// Split into rows to drop (not desired) and URLs to add (desired, not yet
/// in the ledger), keeping input order.
fn diff_attachments(
    current: &[AttachmentFile],
    desired: &[String],
) -> (Vec<AttachmentFile>, Vec<String>) {
    // Same object under another base URL or query string is the same file.
    let key = |url: &str| {
        StoragePath::from_url(url).map_or_else(|| url.to_string(), |path| path.to_string())
    };
    let desired_set: HashSet<String> = desired.iter().map(|url| key(url)).collect();
    let current_set: HashSet<String> = current.iter().map(|row| key(&row.file_url)).collect();

    let removed = current
        .iter()
        .filter(|row| !desired_set.contains(&key(&row.file_url)))
        .cloned()
        .collect();
    let added = desired
        .iter()
        .filter(|url| !current_set.contains(&key(url)))
        .cloned()
        .collect();
    (removed, added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::maintenance::Category,
        services::{
            maintenance_repository::SqliteMaintenanceRepository,
            testing::{FlakyLedger, MemoryStore},
        },
    };
    use chrono::NaiveDate;

    struct Fixture {
        coordinator: LifecycleCoordinator,
        store: Arc<MemoryStore>,
        ledger: Arc<FlakyLedger>,
        owner: Uuid,
        vehicle: Uuid,
    }

    async fn fixture() -> Fixture {
        let pool = Arc::new(db::memory_pool().await.unwrap());
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(FlakyLedger::new(pool.clone()));
        let records = Arc::new(SqliteMaintenanceRepository::new(pool));
        Fixture {
            coordinator: LifecycleCoordinator::new(store.clone(), records, ledger.clone()),
            store,
            ledger,
            owner: Uuid::new_v4(),
            vehicle: Uuid::new_v4(),
        }
    }

    fn fields(title: &str, category: Category) -> MaintenanceFields {
        MaintenanceFields {
            title: title.into(),
            category: Some(category),
            performed_on: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        }
    }

    fn photo(tag: &'static [u8]) -> PickedFile {
        PickedFile {
            bytes: Bytes::from_static(tag),
            mime_type: "image/jpeg".into(),
        }
    }

    impl Fixture {
        async fn stage(&self, maintenance_id: Option<Uuid>, count: usize) -> Vec<String> {
            let files = (0..count).map(|_| photo(b"jpeg")).collect();
            self.coordinator
                .stage_uploads(self.owner, self.vehicle, maintenance_id, files)
                .await
                .unwrap()
                .into_iter()
                .map(|object| object.url)
                .collect()
        }

        async fn create(&self, urls: &[String]) -> MaintenanceRecord {
            self.coordinator
                .create_with_attachments(
                    self.owner,
                    self.vehicle,
                    &fields("Oil change", Category::Oil),
                    urls,
                )
                .await
                .unwrap()
                .record
        }

        async fn ledger_urls(&self, id: Uuid) -> Vec<String> {
            self.ledger
                .list(id, self.owner)
                .await
                .unwrap()
                .into_iter()
                .map(|row| row.file_url)
                .collect()
        }
    }

    #[test]
    fn saga_tables_follow_declared_policies() {
        assert_eq!(Step::CreateRecord.policy(), Policy::Abort);
        assert_eq!(Step::RegisterFile.policy(), Policy::Collect);
        assert!(
            DELETE_STEPS
                .iter()
                .take_while(|step| **step != Step::DeleteRecord)
                .skip(2)
                .all(|step| step.policy() == Policy::BestEffort)
        );
        assert_eq!(UPDATE_STEPS.last(), Some(&Step::RemoveObject));
    }

    #[tokio::test]
    async fn create_links_staged_photos_in_upload_order() {
        let fx = fixture().await;
        let urls = fx.stage(None, 2).await;

        let view = fx
            .coordinator
            .create_with_attachments(
                fx.owner,
                fx.vehicle,
                &fields("Oil change", Category::Oil),
                &urls,
            )
            .await
            .unwrap();

        assert_eq!(view.record.category, Category::Oil);
        assert_eq!(view.attachments.len(), 2);
        let rows = fx.ledger.list(view.record.id, fx.owner).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(
            rows.iter()
                .all(|row| row.maintenance_id == view.record.id && row.owner_id == fx.owner)
        );
        assert_eq!(fx.ledger_urls(view.record.id).await, urls);
    }

    #[tokio::test]
    async fn create_rejects_invalid_input_before_writing() {
        let fx = fixture().await;
        let urls = fx.stage(None, 1).await;

        let err = fx
            .coordinator
            .create_with_attachments(fx.owner, fx.vehicle, &fields("  ", Category::Oil), &urls)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let foreign = vec!["https://cdn.example.com/receipt.jpg".to_string()];
        let err = fx
            .coordinator
            .create_with_attachments(fx.owner, fx.vehicle, &fields("Wash", Category::Wash), &foreign)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let err = fx
            .coordinator
            .create_with_attachments(
                Uuid::new_v4(),
                fx.vehicle,
                &fields("Wash", Category::Wash),
                &urls,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let records = fx
            .coordinator
            .list_for_vehicle(fx.owner, fx.vehicle)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn create_keeps_record_when_registration_fails() {
        let fx = fixture().await;
        let urls = fx.stage(None, 2).await;
        fx.ledger.fail_add_for(&urls[1]);

        let err = fx
            .coordinator
            .create_with_attachments(
                fx.owner,
                fx.vehicle,
                &fields("Receipt scan", Category::General),
                &urls,
            )
            .await
            .unwrap_err();

        let LifecycleError::PartialFailure(report) = err else {
            panic!("expected a partial failure");
        };
        let id = report.maintenance_id.unwrap();
        assert_eq!(report.succeeded, vec![urls[0].clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file, urls[1]);

        let view = fx.coordinator.get_with_attachments(fx.owner, id).await.unwrap();
        assert_eq!(view.record.title, "Receipt scan");
        assert_eq!(fx.ledger_urls(id).await, vec![urls[0].clone()]);
        assert!(fx.store.contains(&urls[1]));
    }

    #[tokio::test]
    async fn update_swaps_files_even_when_old_object_removal_fails() {
        let fx = fixture().await;
        let original = fx.stage(None, 1).await;
        let record = fx.create(&original).await;
        let file_a = original[0].clone();
        let file_b = fx.stage(Some(record.id), 1).await.remove(0);
        fx.store.fail_removal_of(&file_a);

        let outcome = fx
            .coordinator
            .update_with_attachments(
                fx.owner,
                record.id,
                MaintenancePatch::default(),
                Some(vec![file_b.clone()]),
            )
            .await
            .unwrap();

        assert_eq!(fx.ledger_urls(record.id).await, vec![file_b.clone()]);
        assert_eq!(outcome.attachments.len(), 1);
        assert_eq!(outcome.attachments[0].url, file_b);
        assert_eq!(
            outcome.orphaned,
            vec![StoragePath::from_url(&file_a).unwrap()]
        );
        assert!(outcome.still_linked.is_empty());
        assert_eq!(outcome.record.title, record.title);
        assert_eq!(outcome.record.cost, record.cost);
        assert_eq!(outcome.record.performed_on, record.performed_on);
        assert_eq!(outcome.record.category, record.category);
    }

    #[tokio::test]
    async fn update_adds_first_file_and_sets_cost() {
        let fx = fixture().await;
        let record = fx.create(&[]).await;
        assert_eq!(record.cost, None);
        let staged = fx.stage(Some(record.id), 1).await;

        let patch = MaintenancePatch {
            cost: Some(Some(450.0)),
            ..Default::default()
        };
        let outcome = fx
            .coordinator
            .update_with_attachments(fx.owner, record.id, patch, Some(staged.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.record.cost, Some(450.0));
        assert_eq!(fx.ledger_urls(record.id).await, staged);
    }

    #[tokio::test]
    async fn update_registration_failure_leaves_fields_untouched() {
        let fx = fixture().await;
        let record = fx.create(&[]).await;
        let staged = fx.stage(Some(record.id), 1).await;
        fx.ledger.fail_add_for(&staged[0]);

        let patch = MaintenancePatch {
            title: Some("Brake pads".into()),
            ..Default::default()
        };
        let err = fx
            .coordinator
            .update_with_attachments(fx.owner, record.id, patch, Some(staged))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PartialFailure(_)));

        let view = fx
            .coordinator
            .get_with_attachments(fx.owner, record.id)
            .await
            .unwrap();
        assert_eq!(view.record.title, "Oil change");
        assert!(view.attachments.is_empty());
    }

    #[tokio::test]
    async fn update_without_attachment_list_keeps_files() {
        let fx = fixture().await;
        let staged = fx.stage(None, 2).await;
        let record = fx.create(&staged).await;

        let patch = MaintenancePatch {
            odometer: Some(Some(98_000)),
            ..Default::default()
        };
        let outcome = fx
            .coordinator
            .update_with_attachments(fx.owner, record.id, patch, None)
            .await
            .unwrap();

        assert_eq!(outcome.record.odometer, Some(98_000));
        assert_eq!(fx.ledger_urls(record.id).await, staged);
        assert!(fx.store.removed().is_empty());
    }

    #[tokio::test]
    async fn update_reports_rows_that_stayed_linked() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let record = fx.create(&staged).await;
        fx.ledger.fail_unlinks();

        let outcome = fx
            .coordinator
            .update_with_attachments(fx.owner, record.id, MaintenancePatch::default(), Some(vec![]))
            .await
            .unwrap();

        assert_eq!(outcome.still_linked.len(), 1);
        assert_eq!(outcome.attachments.len(), 1);
        assert!(!fx.store.contains(&staged[0]));
    }

    #[tokio::test]
    async fn update_of_foreign_record_is_not_found() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let record = fx.create(&staged).await;

        let err = fx
            .coordinator
            .update_with_attachments(Uuid::new_v4(), record.id, MaintenancePatch::default(), Some(vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::NotFound));
        assert_eq!(fx.ledger_urls(record.id).await, staged);
    }

    #[tokio::test]
    async fn delete_cascades_and_skips_malformed_rows() {
        let fx = fixture().await;
        let staged = fx.stage(None, 2).await;
        let record = fx.create(&staged).await;
        fx.ledger
            .add(record.id, fx.owner, "https://legacy.example.com/files/receipt")
            .await
            .unwrap();
        fx.store.fail_removal_of(&staged[1]);

        let outcome = fx
            .coordinator
            .delete_with_attachments(fx.owner, record.id)
            .await
            .unwrap();

        assert_eq!(outcome.unresolvable, 1);
        assert_eq!(outcome.removed_objects, 1);
        assert_eq!(
            outcome.orphaned,
            vec![StoragePath::from_url(&staged[1]).unwrap()]
        );

        let attempted = fx.store.removal_attempts();
        assert_eq!(attempted.len(), 2);
        assert!(fx.ledger_urls(record.id).await.is_empty());
        assert!(matches!(
            fx.coordinator.get_with_attachments(fx.owner, record.id).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_survives_ledger_bulk_failure() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let record = fx.create(&staged).await;
        fx.ledger.fail_bulk_removal();

        fx.coordinator
            .delete_with_attachments(fx.owner, record.id)
            .await
            .unwrap();

        assert!(fx.ledger_urls(record.id).await.is_empty());
        assert!(matches!(
            fx.coordinator.get_with_attachments(fx.owner, record.id).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_of_missing_record_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .coordinator
            .delete_with_attachments(fx.owner, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound));
        assert!(fx.store.removal_attempts().is_empty());
    }

    #[tokio::test]
    async fn stage_uploads_reports_which_files_were_stored() {
        let fx = fixture().await;
        let files = vec![
            photo(b"one"),
            PickedFile {
                bytes: Bytes::new(),
                mime_type: "image/png".into(),
            },
            photo(b"three"),
        ];

        let err = fx
            .coordinator
            .stage_uploads(fx.owner, fx.vehicle, None, files)
            .await
            .unwrap_err();

        let LifecycleError::PartialFailure(report) = err else {
            panic!("expected a partial failure");
        };
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file, "1");
        assert!(report.succeeded.iter().all(|url| fx.store.contains(url)));
    }

    #[tokio::test]
    async fn single_failed_upload_surfaces_storage_error() {
        let fx = fixture().await;
        let err = fx
            .coordinator
            .stage_upload(
                fx.owner,
                fx.vehicle,
                None,
                PickedFile {
                    bytes: Bytes::new(),
                    mime_type: "image/png".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Storage(_)));
    }

    #[tokio::test]
    async fn discard_staged_only_touches_unlinked_owned_files() {
        let fx = fixture().await;
        let staged = fx.stage(None, 2).await;
        let record = fx.create(&staged[..1]).await;
        let loose = fx.stage(Some(record.id), 1).await.remove(0);

        assert!(matches!(
            fx.coordinator.discard_staged(Uuid::new_v4(), &staged[1]).await,
            Err(LifecycleError::NotFound)
        ));
        assert_eq!(
            fx.coordinator.discard_staged(fx.owner, &staged[1]).await.unwrap(),
            Removal::Removed
        );
        assert_eq!(
            fx.coordinator.discard_staged(fx.owner, &staged[1]).await.unwrap(),
            Removal::NotFound
        );
        assert_eq!(
            fx.coordinator.discard_staged(fx.owner, &loose).await.unwrap(),
            Removal::Removed
        );

        let linked = fx.stage(Some(record.id), 1).await.remove(0);
        fx.ledger.add(record.id, fx.owner, &linked).await.unwrap();
        assert!(matches!(
            fx.coordinator.discard_staged(fx.owner, &linked).await,
            Err(LifecycleError::Validation(_))
        ));
        assert!(fx.store.contains(&linked));
    }

    #[tokio::test]
    async fn discard_refuses_staged_url_linked_at_create() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let record = fx.create(&staged).await;

        assert!(matches!(
            fx.coordinator.discard_staged(fx.owner, &staged[0]).await,
            Err(LifecycleError::Validation(_))
        ));
        assert!(fx.store.contains(&staged[0]));
        assert_eq!(fx.ledger_urls(record.id).await, staged);
    }

    #[tokio::test]
    async fn create_refuses_url_linked_to_another_record() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let first = fx.create(&staged).await;

        let err = fx
            .coordinator
            .create_with_attachments(
                fx.owner,
                fx.vehicle,
                &fields("Brake pads", Category::Maintenance),
                &staged,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let records = fx
            .coordinator
            .list_for_vehicle(fx.owner, fx.vehicle)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fx.ledger_urls(first.id).await, staged);
        assert!(fx.store.contains(&staged[0]));
    }

    #[tokio::test]
    async fn update_refuses_url_linked_to_another_record() {
        let fx = fixture().await;
        let shared = fx.stage(None, 1).await;
        let first = fx.create(&shared).await;
        let second = fx.create(&[]).await;

        let err = fx
            .coordinator
            .update_with_attachments(
                fx.owner,
                second.id,
                MaintenancePatch::default(),
                Some(shared.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
        assert!(fx.ledger_urls(second.id).await.is_empty());

        fx.coordinator
            .delete_with_attachments(fx.owner, second.id)
            .await
            .unwrap();
        assert_eq!(fx.ledger_urls(first.id).await, shared);
        assert!(fx.store.contains(&shared[0]));
    }

    #[tokio::test]
    async fn update_treats_url_variants_as_the_same_file() {
        let fx = fixture().await;
        let staged = fx.stage(None, 1).await;
        let record = fx.create(&staged).await;
        let same_object = format!("{}?download=1", staged[0]);

        let outcome = fx
            .coordinator
            .update_with_attachments(
                fx.owner,
                record.id,
                MaintenancePatch::default(),
                Some(vec![same_object]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.attachments.len(), 1);
        assert_eq!(fx.ledger_urls(record.id).await, staged);
        assert!(fx.store.contains(&staged[0]));
    }

    #[tokio::test]
    async fn remove_attachment_unlinks_and_removes_object() {
        let fx = fixture().await;
        let staged = fx.stage(None, 2).await;
        let record = fx.create(&staged).await;
        let rows = fx.ledger.list(record.id, fx.owner).await.unwrap();

        assert!(matches!(
            fx.coordinator
                .remove_attachment(Uuid::new_v4(), rows[0].id)
                .await,
            Err(LifecycleError::NotFound)
        ));

        fx.coordinator
            .remove_attachment(fx.owner, rows[0].id)
            .await
            .unwrap();

        assert_eq!(fx.ledger_urls(record.id).await, vec![staged[1].clone()]);
        assert!(!fx.store.contains(&staged[0]));
        assert!(matches!(
            fx.coordinator.remove_attachment(fx.owner, rows[0].id).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn legacy_attachment_is_shown_and_can_be_cleared() {
        let fx = fixture().await;
        let record = fx.create(&[]).await;
        let legacy = fx.stage(Some(record.id), 1).await.remove(0);
        sqlx::query("UPDATE maintenance SET legacy_attachment_url = ? WHERE id = ?")
            .bind(&legacy)
            .bind(record.id)
            .execute(&*fx.ledger.inner.db)
            .await
            .unwrap();

        let view = fx
            .coordinator
            .get_with_attachments(fx.owner, record.id)
            .await
            .unwrap();
        assert_eq!(view.attachments.len(), 1);
        assert!(view.attachments[0].legacy);
        assert_eq!(view.attachments[0].id, None);

        let patch: MaintenancePatch =
            serde_json::from_str(r#"{"legacy_attachment_url": null}"#).unwrap();
        let outcome = fx
            .coordinator
            .update_with_attachments(fx.owner, record.id, patch, None)
            .await
            .unwrap();

        assert_eq!(outcome.record.legacy_attachment_url, None);
        assert!(outcome.attachments.is_empty());
        assert!(!fx.store.contains(&legacy));
    }

    #[test]
    fn diff_keeps_desired_order() {
        let row = |url: &str| AttachmentFile {
            id: Uuid::new_v4(),
            maintenance_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            file_url: url.into(),
            uploaded_at: chrono::Utc::now(),
        };
        let current = vec![row("a"), row("b")];
        let desired = vec!["c".to_string(), "b".to_string(), "d".to_string()];

        let (removed, added) = diff_attachments(&current, &desired);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].file_url, "a");
        assert_eq!(added, vec!["c".to_string(), "d".to_string()]);
    }
}
