//! SQLite database store implementation.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::crypto::FieldCipher;
use super::models::*;
use super::traits::{HistoryStore, TargetStore};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Notifications kept when no explicit limit is configured.
pub const DEFAULT_NOTIFICATION_LIMIT: usize = 100;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// All access goes through one connection behind a mutex, so every call is
/// serialized against every other caller.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    notification_limit: usize,
    cipher: Option<Arc<FieldCipher>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notification_limit: DEFAULT_NOTIFICATION_LIMIT,
            cipher: None,
        })
    }

    /// Decrypt target addresses on read.
    pub fn with_cipher(mut self, cipher: FieldCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    fn reveal(&self, mut target: Target) -> Target {
        if let Some(cipher) = &self.cipher {
            target.address = cipher.reveal(&target.address);
        }
        target
    }

    pub fn with_notification_limit(mut self, limit: usize) -> Self {
        self.notification_limit = limit.max(1);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Targets ---

    /// Get a target by ID.
    pub fn get_target(&self, id: &str) -> Result<Target, DbError> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id],
                target_from_row,
            )
            .optional()?;
        target.map(|t| self.reveal(t)).ok_or(DbError::NotFound)
    }
}

const TARGET_COLUMNS: &str = "id, name, description, probe_type, address, payload, interval_secs, \
     timeout_ms, latency_threshold_ms, auth_mode, auth_token, is_public, show_target, \
     allow_unauthorized, display_order";

fn target_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Target> {
    let auth_mode: String = row.get(9)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        probe_type: row.get(3)?,
        address: row.get(4)?,
        payload: row.get(5)?,
        interval_secs: non_negative(row.get(6)?),
        timeout_ms: non_negative(row.get(7)?),
        latency_threshold_ms: non_negative(row.get(8)?),
        auth_mode: AuthMode::parse(&auth_mode),
        auth_token: row.get(10)?,
        is_public: row.get(11)?,
        show_target: row.get(12)?,
        allow_unauthorized: row.get(13)?,
        display_order: row.get(14)?,
    })
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

impl TargetStore for Store {
    fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets ORDER BY display_order ASC, name ASC",
            TARGET_COLUMNS
        ))?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets.into_iter().map(|t| self.reveal(t)).collect())
    }
}

/// Raw incident columns, converted outside the row closure so bad values surface as
/// `DbError::InvalidValue`.
type IncidentRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<i64>,
);

fn incident_from_row(row: IncidentRow) -> Result<Incident, DbError> {
    let (id, target_id, start, end, status, description, cause, duration_mins) = row;
    let start_time = parse_db_time(&start)
        .ok_or_else(|| DbError::InvalidValue(format!("incident {} start time: {}", id, start)))?;
    let end_time = match end {
        Some(s) => Some(
            parse_db_time(&s)
                .ok_or_else(|| DbError::InvalidValue(format!("incident {} end time: {}", id, s)))?,
        ),
        None => None,
    };

    Ok(Incident {
        status: status.parse().map_err(DbError::InvalidValue)?,
        id,
        target_id,
        start_time,
        end_time,
        description,
        cause,
        duration_mins,
    })
}

impl HistoryStore for Store {
    fn append_log(&self, entry: &LogEntry) -> Result<(), DbError> {
        let day = entry.time.with_timezone(&Local).date_naive();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO logs (id, target_id, time, day, status, latency_ms, status_code, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.target_id,
                fmt_db_time(&entry.time),
                day.format(DATE_FORMAT).to_string(),
                entry.status.as_str(),
                entry.latency_ms as i64,
                entry.status_code,
                entry.message,
            ],
        )?;
        Ok(())
    }

    fn open_incidents(&self) -> Result<Vec<Incident>, DbError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, target_id, start_time, end_time, status, description, cause, duration_mins
                 FROM incidents WHERE end_time IS NULL ORDER BY start_time DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?
                .collect::<SqlResult<Vec<IncidentRow>>>()?;
            rows
        };

        rows.into_iter().map(incident_from_row).collect()
    }

    fn save_incident(&self, incident: &Incident) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (id, target_id, start_time, end_time, status, description, cause, duration_mins)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
             end_time=excluded.end_time, status=excluded.status, description=excluded.description,
             cause=excluded.cause, duration_mins=excluded.duration_mins",
            params![
                incident.id,
                incident.target_id,
                fmt_db_time(&incident.start_time),
                incident.end_time.as_ref().map(fmt_db_time),
                incident.status.as_str(),
                incident.description,
                incident.cause,
                incident.duration_mins,
            ],
        )?;
        Ok(())
    }

    fn save_notification(&self, notification: &Notification) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO notifications (id, kind, message, time, read, target_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                notification.id,
                notification.kind.as_str(),
                notification.message,
                fmt_db_time(&notification.time),
                notification.read,
                notification.target_id,
            ],
        )?;
        // Only the newest notifications are kept.
        tx.execute(
            "DELETE FROM notifications WHERE id NOT IN
             (SELECT id FROM notifications ORDER BY time DESC LIMIT ?1)",
            params![self.notification_limit as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn increment_daily_stat(
        &self,
        target_id: &str,
        date: NaiveDate,
        delta: StatDelta,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO daily_stats (target_id, date, up, down, degraded, total_latency, count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(target_id, date) DO UPDATE SET
             up = up + excluded.up,
             down = down + excluded.down,
             degraded = degraded + excluded.degraded,
             total_latency = total_latency + excluded.total_latency,
             count = count + excluded.count",
            params![
                target_id,
                date.format(DATE_FORMAT).to_string(),
                delta.up,
                delta.down,
                delta.degraded,
                delta.latency,
                delta.count,
            ],
        )?;
        Ok(())
    }

    fn daily_stats(&self, target_id: &str, since: NaiveDate) -> Result<Vec<DailyStat>, DbError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT date, up, down, degraded, total_latency, count FROM daily_stats
                 WHERE target_id = ?1 AND date >= ?2 ORDER BY date ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![target_id, since.format(DATE_FORMAT).to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )?
                .collect::<SqlResult<Vec<(String, i64, i64, i64, i64, i64)>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(date, up, down, degraded, total_latency, count)| {
                let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
                    .map_err(|e| DbError::InvalidValue(format!("stat date {}: {}", date, e)))?;
                Ok(DailyStat {
                    target_id: target_id.to_string(),
                    date,
                    up,
                    down,
                    degraded,
                    total_latency,
                    count,
                })
            })
            .collect()
    }

    fn rebuild_daily_stats(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        // WHERE 1 keeps SQLite from reading ON CONFLICT as a join constraint.
        let written = conn.execute(
            "INSERT INTO daily_stats (target_id, date, up, down, degraded, total_latency, count)
             SELECT target_id, day,
                    SUM(status = 'UP'), SUM(status = 'DOWN'), SUM(status = 'DEGRADED'),
                    SUM(latency_ms), COUNT(*)
             FROM logs WHERE 1 GROUP BY target_id, day
             ON CONFLICT(target_id, date) DO UPDATE SET
             up = excluded.up,
             down = excluded.down,
             degraded = excluded.degraded,
             total_latency = excluded.total_latency,
             count = excluded.count",
            [],
        )?;
        Ok(written)
    }
}

fn fmt_db_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
impl Store {
    pub fn upsert_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO targets ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                TARGET_COLUMNS
            ),
            params![
                target.id,
                target.name,
                target.description,
                target.probe_type,
                target.address,
                target.payload,
                target.interval_secs as i64,
                target.timeout_ms as i64,
                target.latency_threshold_ms as i64,
                target.auth_mode.as_str(),
                target.auth_token,
                target.is_public,
                target.show_target,
                target.allow_unauthorized,
                target.display_order,
            ],
        )?;
        Ok(())
    }

    pub fn incidents_for(&self, target_id: &str) -> Result<Vec<Incident>, DbError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, target_id, start_time, end_time, status, description, cause, duration_mins
                 FROM incidents WHERE target_id = ?1 ORDER BY start_time ASC",
            )?;
            let rows = stmt
                .query_map(params![target_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?
                .collect::<SqlResult<Vec<IncidentRow>>>()?;
            rows
        };
        rows.into_iter().map(incident_from_row).collect()
    }

    /// (kind, message) pairs, newest first.
    pub fn notifications(&self) -> Result<Vec<(String, String)>, DbError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT kind, message FROM notifications ORDER BY time DESC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// (status, message) pairs for a target, oldest first.
    pub fn logs_for(&self, target_id: &str) -> Result<Vec<(String, Option<String>)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, message FROM logs WHERE target_id = ?1 ORDER BY time ASC")?;
        let rows = stmt
            .query_map(params![target_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn log(target_id: &str, status: Status, latency_ms: u64) -> LogEntry {
        LogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            time: Utc::now(),
            status,
            latency_ms,
            status_code: None,
            message: None,
        }
    }

    #[test]
    fn test_list_targets_in_display_order() {
        let (_tmp, store) = test_store();

        for (id, order) in [("b", 2), ("a", 1)] {
            store
                .upsert_target(&Target {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    display_order: order,
                    auth_mode: AuthMode::Bearer,
                    ..Default::default()
                })
                .unwrap();
        }

        let targets = store.list_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "a");
        assert_eq!(targets[0].auth_mode, AuthMode::Bearer);
        assert_eq!(store.get_target("b").unwrap().name, "B");
        assert!(matches!(store.get_target("zzz"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_encrypted_addresses_decrypted_on_read() {
        let key = "11".repeat(32);
        let (_tmp, store) = test_store();
        let store = store.with_cipher(FieldCipher::from_hex_key(&key).unwrap());
        let writer = FieldCipher::from_hex_key(&key).unwrap();

        let secret = "postgres://monitor:pw@10.1.2.3:5432/app";
        for (id, address) in [("enc", writer.encrypt(secret)), ("plain", "db.local:5432".to_string())] {
            store
                .upsert_target(&Target {
                    id: id.to_string(),
                    name: id.to_string(),
                    address,
                    ..Default::default()
                })
                .unwrap();
        }

        let targets = store.list_targets().unwrap();
        let enc = targets.iter().find(|t| t.id == "enc").unwrap();
        let plain = targets.iter().find(|t| t.id == "plain").unwrap();
        assert_eq!(enc.address, secret);
        assert_eq!(plain.address, "db.local:5432");
        assert_eq!(store.get_target("enc").unwrap().address, secret);
    }

    #[test]
    fn test_increment_daily_stat_accumulates() {
        let (_tmp, store) = test_store();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        store
            .increment_daily_stat("t1", day, StatDelta { up: 1, latency: 40, count: 1, ..Default::default() })
            .unwrap();
        store
            .increment_daily_stat("t1", day, StatDelta { down: 1, latency: 10, count: 1, ..Default::default() })
            .unwrap();

        let stats = store.daily_stats("t1", day).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].up, 1);
        assert_eq!(stats[0].down, 1);
        assert_eq!(stats[0].total_latency, 50);
        assert_eq!(stats[0].count, 2);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let (_tmp, store) = test_store();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .increment_daily_stat(
                                "t1",
                                day,
                                StatDelta { up: 1, count: 1, ..Default::default() },
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = store.daily_stats("t1", day).unwrap();
        assert_eq!(stats[0].count, 200);
        assert_eq!(stats[0].up, 200);
    }

    #[test]
    fn test_incident_upsert_and_open_scan() {
        let (_tmp, store) = test_store();
        let start = Utc::now() - ChronoDuration::minutes(10);
        let mut incident = Incident {
            id: "i1".to_string(),
            target_id: "t1".to_string(),
            start_time: start,
            end_time: None,
            status: Status::Down,
            description: "Service Down".to_string(),
            cause: None,
            duration_mins: None,
        };
        store.save_incident(&incident).unwrap();

        let open = store.open_incidents().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "i1");

        incident.end_time = Some(Utc::now());
        incident.duration_mins = Some(10);
        incident.status = Status::Up;
        store.save_incident(&incident).unwrap();

        assert!(store.open_incidents().unwrap().is_empty());
        let all = store.incidents_for("t1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, Status::Up);
        assert_eq!(all[0].duration_mins, Some(10));
    }

    #[test]
    fn test_notifications_are_capped() {
        let (_tmp, store) = test_store();
        let store = store.with_notification_limit(3);
        let base = Utc::now();

        for i in 0..5 {
            store
                .save_notification(&Notification {
                    id: format!("n{}", i),
                    kind: NotificationKind::Down,
                    message: format!("message {}", i),
                    time: base + ChronoDuration::seconds(i),
                    read: false,
                    target_id: Some("t1".to_string()),
                })
                .unwrap();
        }

        let kept = store.notifications().unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].1, "message 4");
        assert_eq!(kept[2].1, "message 2");
    }

    #[test]
    fn test_rebuild_daily_stats_from_logs() {
        let (_tmp, store) = test_store();
        store.append_log(&log("t1", Status::Up, 20)).unwrap();
        store.append_log(&log("t1", Status::Down, 0)).unwrap();
        store.append_log(&log("t1", Status::Degraded, 300)).unwrap();
        store.append_log(&log("t2", Status::Up, 5)).unwrap();

        let written = store.rebuild_daily_stats().unwrap();
        assert_eq!(written, 2);

        let today = Local::now().date_naive();
        let stats = store.daily_stats("t1", today - ChronoDuration::days(1)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].up, stats[0].down, stats[0].degraded), (1, 1, 1));
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].total_latency, 320);

        // A second rebuild replaces rather than doubles.
        store.rebuild_daily_stats().unwrap();
        let stats = store.daily_stats("t1", today - ChronoDuration::days(1)).unwrap();
        assert_eq!(stats[0].count, 3);
    }

    #[test]
    fn test_parse_db_time_roundtrip() {
        let now = Utc::now();
        let parsed = parse_db_time(&fmt_db_time(&now)).unwrap();
        assert_eq!(parsed, now);
    }
}
