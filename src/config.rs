//! Configuration module for PulseWatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of probe workers (default: 5)
    pub worker_count: usize,
    /// Global rate limit across all realtime checks, per minute; 0 disables it (default: 1000)
    pub global_rate_limit_per_minute: u32,
    /// How often the scheduler diffs repository state against its in-memory schedule (default: 30s)
    pub reconcile_interval: Duration,
    /// Path to the SQLite database file (default: "pulsewatch.db")
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            global_rate_limit_per_minute: 1000,
            reconcile_interval: Duration::from_secs(30),
            db_path: "pulsewatch.db".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PULSEWATCH_WORKER_COUNT`: probe worker count (default: 5)
    /// - `PULSEWATCH_GLOBAL_RATE_LIMIT`: global probes/minute, 0 = unlimited (default: 1000)
    /// - `PULSEWATCH_RECONCILE_SECONDS`: schedule reconcile period (default: 30)
    /// - `PULSEWATCH_DB_PATH`: database file path (default: "pulsewatch.db")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = env::var("PULSEWATCH_WORKER_COUNT") {
            if let Ok(n) = s.parse::<usize>() {
                if n > 0 {
                    cfg.worker_count = n;
                }
            }
        }

        if let Ok(s) = env::var("PULSEWATCH_GLOBAL_RATE_LIMIT") {
            if let Ok(n) = s.parse() {
                cfg.global_rate_limit_per_minute = n;
            }
        }

        if let Ok(s) = env::var("PULSEWATCH_RECONCILE_SECONDS") {
            if let Ok(n) = s.parse::<u64>() {
                if n > 0 {
                    cfg.reconcile_interval = Duration::from_secs(n);
                }
            }
        }

        if let Ok(path) = env::var("PULSEWATCH_DB_PATH") {
            cfg.db_path = path;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.worker_count, 5);
        assert_eq!(cfg.global_rate_limit_per_minute, 1000);
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(30));
        assert_eq!(cfg.db_path, "pulsewatch.db");
    }
}
