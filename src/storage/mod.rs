//! Repository contracts consumed by the engine, plus the bundled
//! SQLite and in-memory implementations.
//!
//! The engine is agnostic to where checks, domains and results live; it
//! only requires these traits. `list_all` must return every check,
//! including disabled ones, so the reconciler can tear disabled checks
//! down.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::models::{Check, CheckRecord, Domain, NotificationSettings};

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("not found")]
    NotFound,
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub trait CheckRepository: Send + Sync {
    /// Every check, optionally filtered by domain. Includes disabled checks.
    fn list_all(&self, domain_id: Option<i64>) -> Result<Vec<Check>, StorageError>;
    fn get_by_id(&self, id: i64) -> Result<Check, StorageError>;
    /// Insert a check and return it with its assigned id.
    fn add(&self, check: &Check) -> Result<Check, StorageError>;
    /// Full update, including realtime mode and rate limit.
    fn update(&self, check: &Check) -> Result<(), StorageError>;
    fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), StorageError>;
    fn delete(&self, id: i64) -> Result<(), StorageError>;
}

pub trait DomainRepository: Send + Sync {
    fn get_by_id(&self, id: i64) -> Result<Domain, StorageError>;
    fn get_all(&self) -> Result<Vec<Domain>, StorageError>;
    fn add(&self, name: &str) -> Result<Domain, StorageError>;
    fn delete_by_id(&self, id: i64) -> Result<(), StorageError>;
}

/// Append-only result log. The engine never reads back from it.
pub trait ResultRepository: Send + Sync {
    fn add(&self, record: &CheckRecord) -> Result<(), StorageError>;
}

pub trait NotificationRepository: Send + Sync {
    fn list_enabled(&self) -> Result<Vec<NotificationSettings>, StorageError>;
    fn add(&self, settings: &NotificationSettings)
        -> Result<NotificationSettings, StorageError>;
    fn update(&self, id: i64, settings: &NotificationSettings) -> Result<(), StorageError>;
}
