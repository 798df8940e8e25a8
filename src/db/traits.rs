//! Storage interfaces the monitoring engine depends on.

use chrono::NaiveDate;

use super::models::*;
use super::store::DbError;

/// Read access to the target registry.
pub trait TargetStore: Send + Sync {
    /// Returns every configured target, reflecting admin-side edits.
    fn list_targets(&self) -> Result<Vec<Target>, DbError>;
}

/// Write access to check history.
///
/// Every method is its own unit of work; callers never assume a transaction spans
/// more than one call. Implementations must be safe under concurrent callers.
pub trait HistoryStore: Send + Sync {
    fn append_log(&self, entry: &LogEntry) -> Result<(), DbError>;

    /// Incidents without an end time. Used once at startup.
    fn open_incidents(&self) -> Result<Vec<Incident>, DbError>;

    /// Inserts or replaces the incident with the same id.
    fn save_incident(&self, incident: &Incident) -> Result<(), DbError>;

    fn save_notification(&self, notification: &Notification) -> Result<(), DbError>;

    /// Atomically adds `delta` to the (target, date) row, creating it if needed.
    fn increment_daily_stat(
        &self,
        target_id: &str,
        date: NaiveDate,
        delta: StatDelta,
    ) -> Result<(), DbError>;

    /// Daily rows for a target on or after `since`, oldest first.
    fn daily_stats(&self, target_id: &str, since: NaiveDate) -> Result<Vec<DailyStat>, DbError>;

    /// Recomputes every daily row from the log. Returns the number of rows written.
    fn rebuild_daily_stats(&self) -> Result<usize, DbError>;
}
