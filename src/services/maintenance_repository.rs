//! MaintenanceRepository - owner-scoped CRUD over the `maintenance` table.
//!
//! Every statement filters on `owner_id`, so a record belonging to someone
//! else is indistinguishable from one that does not exist.

use crate::{
    models::maintenance::{MaintenancePatch, MaintenanceRecord, NewMaintenance},
    services::errors::{RepositoryError, RepositoryResult},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, owner_id, vehicle_id, title, description, category, cost, \
     odometer, performed_on, next_due_date, next_due_odometer, technician, \
     legacy_attachment_url, created_at, updated_at";

#[async_trait]
pub trait MaintenanceRepository: Send + Sync {
    async fn create(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        fields: &NewMaintenance,
    ) -> RepositoryResult<MaintenanceRecord>;

    async fn get(&self, owner_id: Uuid, id: Uuid) -> RepositoryResult<MaintenanceRecord>;

    /// Records for one vehicle, most recently performed first.
    async fn list_for_vehicle(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
    ) -> RepositoryResult<Vec<MaintenanceRecord>>;

    async fn update(
        &self,
        owner_id: Uuid,
        id: Uuid,
        patch: &MaintenancePatch,
    ) -> RepositoryResult<MaintenanceRecord>;

    async fn delete(&self, owner_id: Uuid, id: Uuid) -> RepositoryResult<()>;
}

#[derive(Clone, Debug)]
pub struct SqliteMaintenanceRepository {
    pub db: Arc<SqlitePool>,
}

impl SqliteMaintenanceRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MaintenanceRepository for SqliteMaintenanceRepository {
    async fn create(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
        fields: &NewMaintenance,
    ) -> RepositoryResult<MaintenanceRecord> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, MaintenanceRecord>(&format!(
            "INSERT INTO maintenance ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(vehicle_id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.category)
        .bind(fields.cost)
        .bind(fields.odometer)
        .bind(fields.performed_on)
        .bind(fields.next_due_date)
        .bind(fields.next_due_odometer)
        .bind(&fields.technician)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        debug!("inserted maintenance {}", record.id);
        Ok(record)
    }

    async fn get(&self, owner_id: Uuid, id: Uuid) -> RepositoryResult<MaintenanceRecord> {
        sqlx::query_as::<_, MaintenanceRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM maintenance WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(RepositoryError::NotFound)
    }

    async fn list_for_vehicle(
        &self,
        owner_id: Uuid,
        vehicle_id: Uuid,
    ) -> RepositoryResult<Vec<MaintenanceRecord>> {
        let rows = sqlx::query_as::<_, MaintenanceRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM maintenance
             WHERE owner_id = ? AND vehicle_id = ?
             ORDER BY performed_on DESC, created_at DESC"
        ))
        .bind(owner_id)
        .bind(vehicle_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Apply only the fields present in `patch`. Last write wins; there is no
    /// version check.
    async fn update(
        &self,
        owner_id: Uuid,
        id: Uuid,
        patch: &MaintenancePatch,
    ) -> RepositoryResult<MaintenanceRecord> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE maintenance SET updated_at = ");
        builder.push_bind(Utc::now());

        if let Some(title) = &patch.title {
            builder.push(", title = ").push_bind(title.clone());
        }
        if let Some(description) = &patch.description {
            builder.push(", description = ").push_bind(description.clone());
        }
        if let Some(category) = patch.category {
            builder.push(", category = ").push_bind(category);
        }
        if let Some(cost) = patch.cost {
            builder.push(", cost = ").push_bind(cost);
        }
        if let Some(odometer) = patch.odometer {
            builder.push(", odometer = ").push_bind(odometer);
        }
        if let Some(performed_on) = patch.performed_on {
            builder.push(", performed_on = ").push_bind(performed_on);
        }
        if let Some(next_due_date) = patch.next_due_date {
            builder.push(", next_due_date = ").push_bind(next_due_date);
        }
        if let Some(next_due_odometer) = patch.next_due_odometer {
            builder
                .push(", next_due_odometer = ")
                .push_bind(next_due_odometer);
        }
        if let Some(technician) = &patch.technician {
            builder.push(", technician = ").push_bind(technician.clone());
        }
        if patch.clears_legacy_attachment() {
            builder.push(", legacy_attachment_url = NULL");
        }

        builder.push(" WHERE id = ").push_bind(id);
        builder.push(" AND owner_id = ").push_bind(owner_id);
        builder.push(" RETURNING ").push(RECORD_COLUMNS);

        builder
            .build_query_as::<MaintenanceRecord>()
            .fetch_optional(&*self.db)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn delete(&self, owner_id: Uuid, id: Uuid) -> RepositoryResult<()> {
        let result = sqlx::query("DELETE FROM maintenance WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        debug!("deleted maintenance {}", id);
        Ok(())
    }
}
