//! In-memory repositories, primarily for tests and embedding.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::models::{Check, CheckRecord, Domain, NotificationSettings};

use super::{
    CheckRepository, DomainRepository, NotificationRepository, ResultRepository, StorageError,
};

#[derive(Default)]
struct Tables {
    domains: Vec<Domain>,
    checks: Vec<Check>,
    results: Vec<CheckRecord>,
    notification_settings: Vec<NotificationSettings>,
}

/// A process-local store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of all persisted results for one check, in insert order.
    pub fn results_for_check(&self, check_id: i64) -> Vec<CheckRecord> {
        self.lock()
            .results
            .iter()
            .filter(|r| r.check_id == check_id)
            .cloned()
            .collect()
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }
}

impl CheckRepository for MemoryStore {
    fn list_all(&self, domain_id: Option<i64>) -> Result<Vec<Check>, StorageError> {
        let tables = self.lock();
        Ok(tables
            .checks
            .iter()
            .filter(|c| domain_id.map_or(true, |d| c.domain_id == d))
            .cloned()
            .collect())
    }

    fn get_by_id(&self, id: i64) -> Result<Check, StorageError> {
        self.lock()
            .checks
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn add(&self, check: &Check) -> Result<Check, StorageError> {
        let mut check = check.clone();
        check.normalize();
        check.id = self.next_id();
        self.lock().checks.push(check.clone());
        Ok(check)
    }

    fn update(&self, check: &Check) -> Result<(), StorageError> {
        let mut check = check.clone();
        check.normalize();
        let mut tables = self.lock();
        let slot = tables
            .checks
            .iter_mut()
            .find(|c| c.id == check.id)
            .ok_or(StorageError::NotFound)?;
        *slot = check;
        Ok(())
    }

    fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let slot = tables
            .checks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StorageError::NotFound)?;
        slot.enabled = enabled;
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<(), StorageError> {
        self.lock().checks.retain(|c| c.id != id);
        Ok(())
    }
}

impl DomainRepository for MemoryStore {
    fn get_by_id(&self, id: i64) -> Result<Domain, StorageError> {
        self.lock()
            .domains
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn get_all(&self) -> Result<Vec<Domain>, StorageError> {
        Ok(self.lock().domains.clone())
    }

    fn add(&self, name: &str) -> Result<Domain, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::Invalid("domain name is empty".to_string()));
        }
        let domain = Domain {
            id: self.next_id(),
            name: name.to_string(),
        };
        self.lock().domains.push(domain.clone());
        Ok(domain)
    }

    fn delete_by_id(&self, id: i64) -> Result<(), StorageError> {
        self.lock().domains.retain(|d| d.id != id);
        Ok(())
    }
}

impl ResultRepository for MemoryStore {
    fn add(&self, record: &CheckRecord) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let mut record = record.clone();
        record.id = tables.results.len() as i64 + 1;
        tables.results.push(record);
        Ok(())
    }
}

impl NotificationRepository for MemoryStore {
    fn list_enabled(&self) -> Result<Vec<NotificationSettings>, StorageError> {
        Ok(self
            .lock()
            .notification_settings
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    fn add(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, StorageError> {
        let mut settings = settings.clone();
        settings.id = self.next_id();
        self.lock().notification_settings.push(settings.clone());
        Ok(settings)
    }

    fn update(&self, id: i64, settings: &NotificationSettings) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let slot = tables
            .notification_settings
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StorageError::NotFound)?;
        let mut settings = settings.clone();
        settings.id = id;
        *slot = settings;
        Ok(())
    }
}
