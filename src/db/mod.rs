//! Snapshot store and tracking state on SQLite.
//!
//! This module is split into two submodules:
//! - `model`: row-level view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into domain types.
//!
//! Reads take the pool. Writes that belong to a sync pass take an open
//! transaction so the change recorder decides the commit boundary.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ChangeRecordFilter, StoredChangeRecord, StoredNotionBlock};
