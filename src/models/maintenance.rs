//! Represents a maintenance event logged against a vehicle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of maintenance performed.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Category {
    Oil,
    Maintenance,
    Wash,
    Inspection,
    Battery,
    Fuel,
    General,
}

/// A maintenance record as stored in the `maintenance` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MaintenanceRecord {
    pub id: Uuid,

    /// Authenticated user the record belongs to.
    pub owner_id: Uuid,

    pub vehicle_id: Uuid,

    pub title: String,

    pub description: String,

    pub category: Category,

    /// Amount paid, never negative.
    pub cost: Option<f64>,

    /// Odometer reading when the work was done.
    pub odometer: Option<i64>,

    pub performed_on: NaiveDate,

    pub next_due_date: Option<NaiveDate>,

    pub next_due_odometer: Option<i64>,

    pub technician: Option<String>,

    /// Deprecated single-attachment slot. Read for old records, never written
    /// by new code; superseded by `maintenance_files`.
    pub legacy_attachment_url: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when logging new maintenance.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MaintenanceFields {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<Category>,
    pub cost: Option<f64>,
    pub odometer: Option<i64>,
    pub performed_on: Option<NaiveDate>,
    pub next_due_date: Option<NaiveDate>,
    pub next_due_odometer: Option<i64>,
    pub technician: Option<String>,
}

/// Partial update of a record. `None` leaves a field alone; for nullable
/// columns `Some(None)` clears it.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MaintenancePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
    #[serde(default, deserialize_with = "double_option")]
    pub cost: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub odometer: Option<Option<i64>>,
    pub performed_on: Option<NaiveDate>,
    #[serde(default, deserialize_with = "double_option")]
    pub next_due_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "double_option")]
    pub next_due_odometer: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub technician: Option<Option<String>>,
    /// Only `Some(None)` is accepted: the legacy slot can be cleared, not set.
    #[serde(default, deserialize_with = "double_option")]
    pub legacy_attachment_url: Option<Option<String>>,
}

/// Validated create input, with every required field present.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMaintenance {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub cost: Option<f64>,
    pub odometer: Option<i64>,
    pub performed_on: NaiveDate,
    pub next_due_date: Option<NaiveDate>,
    pub next_due_odometer: Option<i64>,
    pub technician: Option<String>,
}

impl MaintenanceFields {
    /// Check required fields and ranges. Runs before any store is touched.
    pub fn validate(&self) -> Result<NewMaintenance, String> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err("title is required".into());
        }
        let category = self.category.ok_or("category is required")?;
        let performed_on = self.performed_on.ok_or("performed_on is required")?;
        check_cost(self.cost)?;
        check_reading("odometer", self.odometer)?;
        check_reading("next_due_odometer", self.next_due_odometer)?;

        Ok(NewMaintenance {
            title: title.to_string(),
            description: self.description.trim().to_string(),
            category,
            cost: self.cost,
            odometer: self.odometer,
            performed_on,
            next_due_date: self.next_due_date,
            next_due_odometer: self.next_due_odometer,
            technician: non_blank(self.technician.as_deref()),
        })
    }
}

impl MaintenancePatch {
    /// Check and normalise the patch in place.
    pub fn validate(&mut self) -> Result<(), String> {
        if let Some(title) = self.title.as_mut() {
            let trimmed = title.trim();
            if trimmed.is_empty() {
                return Err("title cannot be empty".into());
            }
            *title = trimmed.to_string();
        }
        if let Some(description) = self.description.as_mut() {
            *description = description.trim().to_string();
        }
        if let Some(cost) = self.cost {
            check_cost(cost)?;
        }
        if let Some(odometer) = self.odometer {
            check_reading("odometer", odometer)?;
        }
        if let Some(next_due) = self.next_due_odometer {
            check_reading("next_due_odometer", next_due)?;
        }
        if let Some(technician) = self.technician.as_mut() {
            *technician = non_blank(technician.as_deref());
        }
        if matches!(self.legacy_attachment_url, Some(Some(_))) {
            return Err("legacy_attachment_url can only be cleared".into());
        }
        Ok(())
    }

    /// True when the patch asks to empty the legacy attachment slot.
    pub fn clears_legacy_attachment(&self) -> bool {
        matches!(self.legacy_attachment_url, Some(None))
    }
}

fn check_cost(cost: Option<f64>) -> Result<(), String> {
    match cost {
        Some(value) if !value.is_finite() || value < 0.0 => {
            Err("cost must be a non-negative amount".into())
        }
        _ => Ok(()),
    }
}

fn check_reading(field: &str, reading: Option<i64>) -> Result<(), String> {
    match reading {
        Some(value) if value < 0 => Err(format!("{} must not be negative", field)),
        _ => Ok(()),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Distinguishes an absent key (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
