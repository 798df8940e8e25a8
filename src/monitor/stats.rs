//! Daily statistics: per-check increments and the uptime/latency reports built on them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Serialize;

use crate::db::{DailyStat, DbError, HistoryStore, Status, StatDelta};

/// Lookback window used when none is configured.
pub const DEFAULT_STATS_DAYS: u32 = 30;

/// The increment one completed check contributes to its day.
pub fn delta_for(status: Status, latency_ms: u64) -> StatDelta {
    StatDelta {
        up: i64::from(status == Status::Up),
        down: i64::from(status == Status::Down),
        degraded: i64::from(status == Status::Degraded),
        latency: i64::try_from(latency_ms).unwrap_or(i64::MAX),
        count: 1,
    }
}

/// Uptime and average latency over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub uptime_pct: f64,
    pub avg_latency_ms: i64,
    pub checks: i64,
}

impl Default for UptimeSummary {
    fn default() -> Self {
        Self {
            uptime_pct: 100.0,
            avg_latency_ms: 0,
            checks: 0,
        }
    }
}

/// Summarize a set of daily rows. No checks means 100% uptime and zero latency.
pub fn summarize(rows: &[DailyStat]) -> UptimeSummary {
    let count: i64 = rows.iter().map(|r| r.count).sum();
    if count <= 0 {
        return UptimeSummary::default();
    }

    let up: i64 = rows.iter().map(|r| r.up).sum();
    let latency: i64 = rows.iter().map(|r| r.total_latency).sum();

    UptimeSummary {
        uptime_pct: up as f64 / count as f64 * 100.0,
        avg_latency_ms: (latency as f64 / count as f64).round() as i64,
        checks: count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayHealth {
    Up,
    Degraded,
    Down,
    Empty,
}

impl DayHealth {
    pub fn of(row: Option<&DailyStat>) -> Self {
        match row {
            None => DayHealth::Empty,
            Some(r) if r.count <= 0 => DayHealth::Empty,
            Some(r) if r.down >= r.count => DayHealth::Down,
            Some(r) if r.down > 0 => DayHealth::Degraded,
            Some(_) => DayHealth::Up,
        }
    }
}

/// First day of a `days`-long window ending on `today` (inclusive).
pub fn window_start(today: NaiveDate, days: u32) -> NaiveDate {
    today - ChronoDuration::days(i64::from(days.max(1)) - 1)
}

/// One entry per day of the window, oldest first, including days without rows.
pub fn timeline(rows: &[DailyStat], today: NaiveDate, days: u32) -> Vec<(NaiveDate, DayHealth)> {
    let by_date: HashMap<NaiveDate, &DailyStat> = rows.iter().map(|r| (r.date, r)).collect();

    window_start(today, days)
        .iter_days()
        .take_while(|day| *day <= today)
        .map(|day| (day, DayHealth::of(by_date.get(&day).copied())))
        .collect()
}

/// Writes per-check increments and reads window reports.
pub struct StatsAggregator {
    store: Arc<dyn HistoryStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Count one completed check against `date`.
    pub fn record(
        &self,
        target_id: &str,
        date: NaiveDate,
        status: Status,
        latency_ms: u64,
    ) -> Result<(), DbError> {
        self.store
            .increment_daily_stat(target_id, date, delta_for(status, latency_ms))
    }

    pub fn summary(
        &self,
        target_id: &str,
        today: NaiveDate,
        days: u32,
    ) -> Result<UptimeSummary, DbError> {
        let rows = self.store.daily_stats(target_id, window_start(today, days))?;
        Ok(summarize(&rows))
    }

    pub fn timeline(
        &self,
        target_id: &str,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<(NaiveDate, DayHealth)>, DbError> {
        let rows = self.store.daily_stats(target_id, window_start(today, days))?;
        Ok(timeline(&rows, today, days))
    }

    /// Recompute every daily row from the log.
    pub fn rebuild(&self) -> Result<usize, DbError> {
        let written = self.store.rebuild_daily_stats()?;
        tracing::info!("Rebuilt {} daily stat rows from logs", written);
        Ok(written)
    }
}
