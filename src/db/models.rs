//! Database model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Check interval used when a target has none configured.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// How the HTTP checker authenticates against a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
}

impl AuthMode {
    #[cfg(test)]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Bearer => "bearer",
        }
    }

    /// Anything other than `bearer` means no authentication.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("bearer") {
            AuthMode::Bearer
        } else {
            AuthMode::None
        }
    }
}

/// A monitoring target configuration.
///
/// Owned by the admin surface; the engine only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub probe_type: String,
    /// URL, `host:port`, IP or connection string depending on `probe_type`.
    pub address: String,
    /// JSON body for the POST variants.
    pub payload: Option<String>,
    pub interval_secs: u64,
    /// Milliseconds; 0 falls back to the engine default.
    pub timeout_ms: u64,
    /// Milliseconds; 0 disables the DEGRADED rule.
    pub latency_threshold_ms: u64,
    pub auth_mode: AuthMode,
    pub auth_token: Option<String>,
    pub is_public: bool,
    pub show_target: bool,
    pub allow_unauthorized: bool,
    pub display_order: i64,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: None,
            probe_type: "http".to_string(),
            address: String::new(),
            payload: None,
            interval_secs: DEFAULT_INTERVAL_SECS,
            timeout_ms: 5000,
            latency_threshold_ms: 0,
            auth_mode: AuthMode::None,
            auth_token: None,
            is_public: false,
            show_target: true,
            allow_unauthorized: false,
            display_order: 0,
        }
    }
}

impl Target {
    pub fn interval(&self) -> Duration {
        let secs = if self.interval_secs == 0 {
            DEFAULT_INTERVAL_SECS
        } else {
            self.interval_secs
        };
        Duration::from_secs(secs)
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.timeout_ms == 0 {
            default
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }
}

/// Final health state of a completed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
    Degraded,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::Degraded => "DEGRADED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            "DEGRADED" => Ok(Status::Degraded),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// A single completed check. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: String,
    pub target_id: String,
    pub time: DateTime<Utc>,
    pub status: Status,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

/// A contiguous impaired period for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: String,
    pub target_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Status,
    pub description: String,
    pub cause: Option<String>,
    /// Whole minutes, set together with `end_time`.
    pub duration_mins: Option<i64>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Per-target, per-day check counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyStat {
    pub target_id: String,
    pub date: NaiveDate,
    pub up: i64,
    pub down: i64,
    pub degraded: i64,
    pub total_latency: i64,
    pub count: i64,
}

/// Amounts added to a `DailyStat` row by one increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatDelta {
    pub up: i64,
    pub down: i64,
    pub degraded: i64,
    pub latency: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    Up,
    Down,
    Info,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Up => "UP",
            NotificationKind::Down => "DOWN",
            NotificationKind::Info => "INFO",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(NotificationKind::Up),
            "DOWN" => Ok(NotificationKind::Down),
            "INFO" => Ok(NotificationKind::Info),
            other => Err(format!("unknown notification type: {}", other)),
        }
    }
}

/// A user-facing alert. `read` is only ever flipped by the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub time: DateTime<Utc>,
    pub read: bool,
    pub target_id: Option<String>,
}
