//! Core data models for the maintenance vault.
//!
//! These entities map to the `maintenance` and `maintenance_files` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod attachment;
pub mod maintenance;
