//! Domain services: storage layout, object store, relational repositories and
//! the lifecycle coordinator tying them together.

pub mod attachment_ledger;
pub mod attachment_store;
pub mod errors;
pub mod legacy;
pub mod lifecycle;
pub mod maintenance_repository;
pub mod storage_path;

#[cfg(test)]
pub mod testing;
