//! Read-side compatibility for records created before the attachment ledger.
//!
//! Older records carry a single `legacy_attachment_url`. When such a record
//! has no ledger rows, the attachment view shows one virtual entry built from
//! that field. The entry has no id, so it cannot be removed through the
//! ledger; clearing the field on the record is the only way to drop it.

use crate::{
    models::{attachment::AttachmentFile, maintenance::MaintenanceRecord},
    services::storage_path::StoragePath,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One attachment as presented to callers.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AttachmentView {
    /// Ledger row id; `None` for the synthesized legacy entry.
    pub id: Option<Uuid>,
    pub url: String,
    pub path: Option<StoragePath>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub legacy: bool,
}

impl AttachmentView {
    /// Whether the entry can be removed through the ledger.
    pub fn removable(&self) -> bool {
        self.id.is_some()
    }
}

impl From<&AttachmentFile> for AttachmentView {
    fn from(row: &AttachmentFile) -> Self {
        Self {
            id: Some(row.id),
            url: row.file_url.clone(),
            path: StoragePath::from_url(&row.file_url),
            uploaded_at: Some(row.uploaded_at),
            legacy: false,
        }
    }
}

/// Build the attachment list for `record` from its ledger rows.
pub fn attachment_view(record: &MaintenanceRecord, rows: &[AttachmentFile]) -> Vec<AttachmentView> {
    if !rows.is_empty() {
        return rows.iter().map(AttachmentView::from).collect();
    }

    legacy_url(record)
        .map(|url| AttachmentView {
            id: None,
            url: url.to_string(),
            path: StoragePath::from_url(url),
            uploaded_at: None,
            legacy: true,
        })
        .into_iter()
        .collect()
}

/// The legacy URL, ignoring blank values.
pub fn legacy_url(record: &MaintenanceRecord) -> Option<&str> {
    record
        .legacy_attachment_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::maintenance::Category;
    use chrono::NaiveDate;

    fn record(legacy: Option<&str>) -> MaintenanceRecord {
        MaintenanceRecord {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            title: "Service".into(),
            description: String::new(),
            category: Category::General,
            cost: None,
            odometer: None,
            performed_on: NaiveDate::from_ymd_opt(2022, 1, 15).unwrap(),
            next_due_date: None,
            next_due_odometer: None,
            technician: None,
            legacy_attachment_url: legacy.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn row(record: &MaintenanceRecord, url: &str) -> AttachmentFile {
        AttachmentFile {
            id: Uuid::new_v4(),
            maintenance_id: record.id,
            owner_id: record.owner_id,
            file_url: url.into(),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn legacy_field_synthesizes_virtual_entry() {
        let record = record(Some("https://old.example/receipt.jpg"));
        let view = attachment_view(&record, &[]);

        assert_eq!(view.len(), 1);
        assert!(view[0].legacy);
        assert_eq!(view[0].id, None);
        assert!(!view[0].removable());
        assert_eq!(view[0].path, None);
    }

    #[test]
    fn ledger_rows_take_precedence_over_legacy_field() {
        let record = record(Some("https://old.example/receipt.jpg"));
        let rows = vec![row(&record, "https://new.example/a.jpg")];
        let view = attachment_view(&record, &rows);

        assert_eq!(view.len(), 1);
        assert!(!view[0].legacy);
        assert_eq!(view[0].id, Some(rows[0].id));
        assert!(view[0].removable());
    }

    #[test]
    fn blank_legacy_field_is_ignored() {
        assert!(attachment_view(&record(Some("   ")), &[]).is_empty());
        assert!(attachment_view(&record(None), &[]).is_empty());
    }
}
