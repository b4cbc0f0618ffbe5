//! SQLite-backed repositories.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    Check, CheckParams, CheckRecord, CheckStatus, CheckType, Domain, NotificationChannel,
    NotificationSettings, Outcome,
};

use super::{
    CheckRepository, DomainRepository, NotificationRepository, ResultRepository, StorageError,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain_id INTEGER NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    interval_seconds INTEGER NOT NULL DEFAULT 60,
    params TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    realtime_mode INTEGER NOT NULL DEFAULT 0,
    rate_limit_per_minute INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    check_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    status_code INTEGER,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    outcome TEXT NOT NULL,
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_check_id ON results(check_id);

CREATE TABLE IF NOT EXISTS notification_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    token TEXT NOT NULL DEFAULT '',
    chat_id TEXT NOT NULL DEFAULT '',
    webhook_url TEXT NOT NULL DEFAULT '',
    notify_on_failure INTEGER NOT NULL DEFAULT 0,
    notify_on_success INTEGER NOT NULL DEFAULT 0,
    notify_on_slow_response INTEGER NOT NULL DEFAULT 0,
    slow_response_threshold_ms INTEGER NOT NULL DEFAULT 0
);
";

/// Thread-safe SQLite store implementing all repository traits.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning means another thread panicked mid-query; the
        // connection itself stays usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check_from_row(row: &Row<'_>) -> rusqlite::Result<Check> {
    let type_str: String = row.get(2)?;
    let params_json: String = row.get(4)?;
    let check_type = CheckType::from_str(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let params: CheckParams = serde_json::from_str(&params_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Check {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        check_type,
        interval_seconds: row.get::<_, i64>(3)?.max(1) as u64,
        params,
        enabled: row.get(5)?,
        realtime_mode: row.get(6)?,
        rate_limit_per_minute: row.get::<_, i64>(7)?.max(0) as u32,
    })
}

const CHECK_COLUMNS: &str =
    "id, domain_id, type, interval_seconds, params, enabled, realtime_mode, rate_limit_per_minute";

impl CheckRepository for SqliteStore {
    fn list_all(&self, domain_id: Option<i64>) -> Result<Vec<Check>, StorageError> {
        let conn = self.lock();
        let mut checks = Vec::new();
        match domain_id {
            Some(domain_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHECK_COLUMNS} FROM checks WHERE domain_id = ?1"
                ))?;
                let rows = stmt.query_map([domain_id], check_from_row)?;
                for row in rows {
                    checks.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT {CHECK_COLUMNS} FROM checks"))?;
                let rows = stmt.query_map([], check_from_row)?;
                for row in rows {
                    checks.push(row?);
                }
            }
        }
        Ok(checks)
    }

    fn get_by_id(&self, id: i64) -> Result<Check, StorageError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {CHECK_COLUMNS} FROM checks WHERE id = ?1"),
            [id],
            check_from_row,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    fn add(&self, check: &Check) -> Result<Check, StorageError> {
        let mut check = check.clone();
        check.normalize();
        let params_json = serde_json::to_string(&check.params)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO checks (domain_id, type, interval_seconds, params, enabled, realtime_mode, rate_limit_per_minute)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                check.domain_id,
                check.check_type.as_str(),
                check.interval_seconds as i64,
                params_json,
                check.enabled,
                check.realtime_mode,
                i64::from(check.rate_limit_per_minute),
            ],
        )?;
        check.id = conn.last_insert_rowid();
        Ok(check)
    }

    fn update(&self, check: &Check) -> Result<(), StorageError> {
        let mut check = check.clone();
        check.normalize();
        let params_json = serde_json::to_string(&check.params)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;

        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE checks SET domain_id = ?1, type = ?2, interval_seconds = ?3, params = ?4,
                    enabled = ?5, realtime_mode = ?6, rate_limit_per_minute = ?7
             WHERE id = ?8",
            params![
                check.domain_id,
                check.check_type.as_str(),
                check.interval_seconds as i64,
                params_json,
                check.enabled,
                check.realtime_mode,
                i64::from(check.rate_limit_per_minute),
                check.id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), StorageError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE checks SET enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute("DELETE FROM checks WHERE id = ?1", [id])?;
        Ok(())
    }
}

impl DomainRepository for SqliteStore {
    fn get_by_id(&self, id: i64) -> Result<Domain, StorageError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name FROM domains WHERE id = ?1",
            [id],
            |row| {
                Ok(Domain {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    fn get_all(&self) -> Result<Vec<Domain>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM domains ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Domain {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut domains = Vec::new();
        for row in rows {
            domains.push(row?);
        }
        Ok(domains)
    }

    fn add(&self, name: &str) -> Result<Domain, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::Invalid("domain name is empty".to_string()));
        }
        let conn = self.lock();
        conn.execute("INSERT INTO domains (name) VALUES (?1)", [name])?;
        Ok(Domain {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    fn delete_by_id(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute("DELETE FROM domains WHERE id = ?1", [id])?;
        Ok(())
    }
}

impl ResultRepository for SqliteStore {
    fn add(&self, record: &CheckRecord) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO results (check_id, status, status_code, duration_ms, outcome, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.check_id,
                record.status.as_str(),
                record.status_code,
                record.duration_ms as i64,
                record.outcome.as_str(),
                record.error_message,
                record.created_at,
            ],
        )?;
        Ok(())
    }
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationSettings> {
    let type_str: String = row.get(1)?;
    let channel = NotificationChannel::from_str(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(NotificationSettings {
        id: row.get(0)?,
        channel,
        enabled: row.get(2)?,
        token: row.get(3)?,
        chat_id: row.get(4)?,
        webhook_url: row.get(5)?,
        notify_on_failure: row.get(6)?,
        notify_on_success: row.get(7)?,
        notify_on_slow_response: row.get(8)?,
        slow_response_threshold_ms: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

const SETTINGS_COLUMNS: &str = "id, type, enabled, token, chat_id, webhook_url, \
     notify_on_failure, notify_on_success, notify_on_slow_response, slow_response_threshold_ms";

impl NotificationRepository for SqliteStore {
    fn list_enabled(&self) -> Result<Vec<NotificationSettings>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SETTINGS_COLUMNS} FROM notification_settings WHERE enabled = 1"
        ))?;
        let rows = stmt.query_map([], settings_from_row)?;
        let mut settings = Vec::new();
        for row in rows {
            settings.push(row?);
        }
        Ok(settings)
    }

    fn add(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO notification_settings \
             (type, enabled, token, chat_id, webhook_url, notify_on_failure, \
              notify_on_success, notify_on_slow_response, slow_response_threshold_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                settings.channel.to_string(),
                settings.enabled,
                settings.token,
                settings.chat_id,
                settings.webhook_url,
                settings.notify_on_failure,
                settings.notify_on_success,
                settings.notify_on_slow_response,
                settings.slow_response_threshold_ms as i64,
            ],
        )?;
        let mut saved = settings.clone();
        saved.id = conn.last_insert_rowid();
        Ok(saved)
    }

    fn update(&self, id: i64, settings: &NotificationSettings) -> Result<(), StorageError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE notification_settings SET type = ?1, enabled = ?2, token = ?3, chat_id = ?4,
                    webhook_url = ?5, notify_on_failure = ?6, notify_on_success = ?7,
                    notify_on_slow_response = ?8, slow_response_threshold_ms = ?9
             WHERE id = ?10",
            params![
                settings.channel.to_string(),
                settings.enabled,
                settings.token,
                settings.chat_id,
                settings.webhook_url,
                settings.notify_on_failure,
                settings.notify_on_success,
                settings.notify_on_slow_response,
                settings.slow_response_threshold_ms as i64,
                id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

// Results are parsed back only in tests and ad-hoc tooling; the engine
// itself never reads the results table.
impl SqliteStore {
    pub fn results_for_check(&self, check_id: i64) -> Result<Vec<CheckRecord>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, check_id, status, status_code, duration_ms, outcome, error_message, created_at
             FROM results WHERE check_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([check_id], |row| {
            let status_str: String = row.get(2)?;
            let outcome_str: String = row.get(5)?;
            let status = match status_str.as_str() {
                "success" => CheckStatus::Success,
                "failure" => CheckStatus::Failure,
                "timeout" => CheckStatus::Timeout,
                _ => CheckStatus::Error,
            };
            let outcome = Outcome::from_str(&outcome_str).unwrap_or(Outcome::Error);
            Ok(CheckRecord {
                id: row.get(0)?,
                check_id: row.get(1)?,
                status,
                status_code: row.get(3)?,
                duration_ms: row.get::<_, i64>(4)?.max(0) as u64,
                outcome,
                error_message: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_check(domain_id: i64) -> Check {
        Check {
            id: 0,
            domain_id,
            check_type: CheckType::Http,
            interval_seconds: 60,
            params: CheckParams {
                path: Some("health".to_string()),
                ..Default::default()
            },
            enabled: true,
            realtime_mode: false,
            rate_limit_per_minute: 0,
        }
    }

    #[test]
    fn test_check_round_trip_normalizes_path() {
        let store = SqliteStore::in_memory().unwrap();
        let domain = DomainRepository::add(&store, "example.com").unwrap();

        let added = CheckRepository::add(&store, &sample_check(domain.id)).unwrap();
        assert!(added.id > 0);

        let fetched = CheckRepository::get_by_id(&store, added.id).unwrap();
        assert_eq!(fetched.params.path.as_deref(), Some("/health"));
        assert_eq!(fetched.check_type, CheckType::Http);
    }

    #[test]
    fn test_list_all_includes_disabled_checks() {
        let store = SqliteStore::in_memory().unwrap();
        let domain = DomainRepository::add(&store, "example.com").unwrap();
        let added = CheckRepository::add(&store, &sample_check(domain.id)).unwrap();

        store.set_enabled(added.id, false).unwrap();
        let all = store.list_all(None).unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);
    }

    #[test]
    fn test_list_all_filters_by_domain() {
        let store = SqliteStore::in_memory().unwrap();
        let a = DomainRepository::add(&store, "a.example").unwrap();
        let b = DomainRepository::add(&store, "b.example").unwrap();
        CheckRepository::add(&store, &sample_check(a.id)).unwrap();
        CheckRepository::add(&store, &sample_check(b.id)).unwrap();

        assert_eq!(store.list_all(Some(a.id)).unwrap().len(), 1);
        assert_eq!(store.list_all(None).unwrap().len(), 2);
    }

    #[test]
    fn test_result_append_and_read_back() {
        let store = SqliteStore::in_memory().unwrap();
        let record = CheckRecord {
            id: 0,
            check_id: 7,
            status: CheckStatus::Success,
            status_code: Some(200),
            duration_ms: 150,
            outcome: Outcome::Http2xx,
            error_message: String::new(),
            created_at: "2024-01-01T12:00:00Z".to_string(),
        };
        ResultRepository::add(&store, &record).unwrap();

        let rows = store.results_for_check(7).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status_code, Some(200));
        assert_eq!(rows[0].outcome, Outcome::Http2xx);
    }

    #[test]
    fn test_notification_settings_enabled_filter() {
        let store = SqliteStore::in_memory().unwrap();
        let mut settings = NotificationSettings {
            id: 0,
            channel: NotificationChannel::Telegram,
            enabled: true,
            token: "t".to_string(),
            chat_id: "c".to_string(),
            webhook_url: String::new(),
            notify_on_failure: true,
            notify_on_success: false,
            notify_on_slow_response: false,
            slow_response_threshold_ms: 0,
        };
        let saved = NotificationRepository::add(&store, &settings).unwrap();
        settings.enabled = false;
        NotificationRepository::add(&store, &settings).unwrap();

        let enabled = store.list_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, saved.id);
    }

    #[test]
    fn test_missing_check_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            CheckRepository::get_by_id(&store, 999),
            Err(StorageError::NotFound)
        ));
    }
}
