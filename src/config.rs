//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::db::DEFAULT_NOTIFICATION_LIMIT;
use crate::monitor::DEFAULT_STATS_DAYS;
use crate::scheduler::{DEFAULT_REFRESH, DEFAULT_TICK};

/// Engine configuration loaded from environment variables.
#[derive(Clone, PartialEq)]
pub struct EngineConfig {
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Check timeout for targets without their own (default: 5000 ms)
    pub default_timeout: Duration,
    /// Scheduler tick (default: 1000 ms)
    pub tick: Duration,
    /// Target list reload interval (default: 60 s)
    pub refresh: Duration,
    /// Lookback window for uptime reports (default: 30 days)
    pub stats_days: u32,
    /// Notifications kept in the store (default: 100)
    pub notification_limit: usize,
    /// Hex AES-256 key for encrypted target addresses (default: none)
    pub encryption_key: Option<String>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("db_path", &self.db_path)
            .field("default_timeout", &self.default_timeout)
            .field("tick", &self.tick)
            .field("refresh", &self.refresh)
            .field("stats_days", &self.stats_days)
            .field("notification_limit", &self.notification_limit)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "*****"))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            default_timeout: Duration::from_millis(5000),
            tick: DEFAULT_TICK,
            refresh: DEFAULT_REFRESH,
            stats_days: DEFAULT_STATS_DAYS,
            notification_limit: DEFAULT_NOTIFICATION_LIMIT,
            encryption_key: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_DEFAULT_TIMEOUT_MS`: Default check timeout (default: 5000)
    /// - `UPTRAIL_TICK_MS`: Scheduler tick (default: 1000)
    /// - `UPTRAIL_REFRESH_SECS`: Target reload interval (default: 60)
    /// - `UPTRAIL_STATS_DAYS`: Report window (default: 30)
    /// - `UPTRAIL_NOTIFICATION_LIMIT`: Notifications kept (default: 100)
    /// - `UPTRAIL_ENCRYPTION_KEY` or `ENCRYPTION_KEY`: 64 hex chars (default: unset)
    ///
    /// Unparseable or zero values are ignored.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let number = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH").filter(|p| !p.is_empty()) {
            cfg.db_path = db_path;
        }
        if let Some(ms) = number("UPTRAIL_DEFAULT_TIMEOUT_MS") {
            cfg.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = number("UPTRAIL_TICK_MS") {
            cfg.tick = Duration::from_millis(ms);
        }
        if let Some(secs) = number("UPTRAIL_REFRESH_SECS") {
            cfg.refresh = Duration::from_secs(secs);
        }
        if let Some(days) = number("UPTRAIL_STATS_DAYS").and_then(|d| u32::try_from(d).ok()) {
            cfg.stats_days = days;
        }
        if let Some(limit) = number("UPTRAIL_NOTIFICATION_LIMIT")
            .and_then(|l| usize::try_from(l).ok())
        {
            cfg.notification_limit = limit;
        }
        cfg.encryption_key = lookup("UPTRAIL_ENCRYPTION_KEY")
            .or_else(|| lookup("ENCRYPTION_KEY"))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.default_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.tick, Duration::from_secs(1));
        assert_eq!(cfg.refresh, Duration::from_secs(60));
        assert_eq!(cfg.stats_days, 30);
        assert_eq!(cfg.notification_limit, 100);
    }

    #[test]
    fn test_overrides() {
        let cfg = from_pairs(&[
            ("UPTRAIL_DB_PATH", "/var/lib/uptrail/state.db"),
            ("UPTRAIL_DEFAULT_TIMEOUT_MS", "2500"),
            ("UPTRAIL_REFRESH_SECS", "15"),
            ("UPTRAIL_NOTIFICATION_LIMIT", "20"),
        ]);
        assert_eq!(cfg.db_path, "/var/lib/uptrail/state.db");
        assert_eq!(cfg.default_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.refresh, Duration::from_secs(15));
        assert_eq!(cfg.notification_limit, 20);
        assert_eq!(cfg.tick, Duration::from_secs(1));
        assert_eq!(cfg.encryption_key, None);
    }

    #[test]
    fn test_encryption_key_fallback_and_redacted_debug() {
        let key = "ab".repeat(32);
        let cfg = from_pairs(&[("ENCRYPTION_KEY", key.as_str())]);
        assert_eq!(cfg.encryption_key.as_deref(), Some(key.as_str()));
        assert!(!format!("{:?}", cfg).contains(&key));

        let cfg = from_pairs(&[("UPTRAIL_ENCRYPTION_KEY", "cd"), ("ENCRYPTION_KEY", "ef")]);
        assert_eq!(cfg.encryption_key.as_deref(), Some("cd"));
    }

    #[test]
    fn test_bad_values_ignored() {
        let cfg = from_pairs(&[
            ("UPTRAIL_TICK_MS", "fast"),
            ("UPTRAIL_STATS_DAYS", "0"),
            ("UPTRAIL_DB_PATH", ""),
        ]);
        assert_eq!(cfg, EngineConfig::default());
    }
}
