//! Per-target incident state machine.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::db::{DbError, HistoryStore, Incident, Status};

/// Description used when a failing check carried no message.
const DEFAULT_DESCRIPTION: &str = "Service Down";

/// An incident that was opened or resolved by a check.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened(Incident),
    Resolved(Incident),
}

impl Transition {
    pub fn incident(&self) -> &Incident {
        match self {
            Transition::Opened(incident) | Transition::Resolved(incident) => incident,
        }
    }
}

/// Tracks the open incident (if any) of every target.
///
/// A target is either healthy (no entry) or impaired (exactly one entry). The map is
/// only touched under its lock, so a target can never gain a second open incident.
#[derive(Default)]
pub struct IncidentTracker {
    open: Mutex<HashMap<String, Incident>>,
}

impl IncidentTracker {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted incidents; only those without an end time are kept and the
    /// newest one wins when a target has several.
    pub fn seed(incidents: Vec<Incident>) -> Self {
        let mut open: HashMap<String, Incident> = HashMap::new();

        for incident in incidents.into_iter().filter(Incident::is_open) {
            match open.get(&incident.target_id) {
                Some(existing) if existing.start_time >= incident.start_time => {
                    tracing::warn!(
                        "Ignoring stale open incident {} for target {}",
                        incident.id,
                        incident.target_id
                    );
                }
                _ => {
                    open.insert(incident.target_id.clone(), incident);
                }
            }
        }

        Self {
            open: Mutex::new(open),
        }
    }

    /// Seed from the store's open incidents.
    pub fn load(store: &dyn HistoryStore) -> Result<Self, DbError> {
        let tracker = Self::seed(store.open_incidents()?);
        tracing::info!("Loaded {} open incidents", tracker.open_count());
        Ok(tracker)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Incident>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_impaired(&self, target_id: &str) -> bool {
        self.lock().contains_key(target_id)
    }

    /// Feed one classified status into the state machine.
    ///
    /// Returns the incident that was opened or closed, or `None` when the target
    /// stays in its current state.
    pub fn observe(
        &self,
        target_id: &str,
        status: Status,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let mut open = self.lock();

        match status {
            Status::Down if !open.contains_key(target_id) => {
                let incident = Incident {
                    id: uuid::Uuid::new_v4().to_string(),
                    target_id: target_id.to_string(),
                    start_time: now,
                    end_time: None,
                    status: Status::Down,
                    description: message
                        .filter(|m| !m.is_empty())
                        .unwrap_or(DEFAULT_DESCRIPTION)
                        .to_string(),
                    cause: None,
                    duration_mins: None,
                };
                open.insert(target_id.to_string(), incident.clone());
                Some(Transition::Opened(incident))
            }
            // Degraded counts as recovered: slowness alone never keeps an incident open.
            Status::Up | Status::Degraded => {
                let mut incident = open.remove(target_id)?;
                incident.end_time = Some(now);
                incident.duration_mins = Some(rounded_minutes(incident.start_time, now));
                incident.status = Status::Up;
                Some(Transition::Resolved(incident))
            }
            Status::Down => None,
        }
    }
}

/// `round((end - start) / 60s)`.
pub fn rounded_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    ((end - start).num_milliseconds() as f64 / 60_000.0).round() as i64
}
