//! Alerts raised on incident transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::incident::Transition;
use crate::db::{HistoryStore, Notification, NotificationKind, Target};

/// Build the notification for an incident transition.
///
/// `message` is the (sanitized) message of the check that caused it.
pub fn notification_for(
    target: &Target,
    transition: &Transition,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Notification {
    let (kind, text) = match transition {
        Transition::Opened(_) => (
            NotificationKind::Down,
            format!(
                "Service {} is DOWN: {}",
                target.name,
                message.filter(|m| !m.is_empty()).unwrap_or("Unknown error")
            ),
        ),
        Transition::Resolved(incident) => (
            NotificationKind::Up,
            format!(
                "Service {} is UP. Duration: {} mins.",
                target.name,
                incident.duration_mins.unwrap_or(0)
            ),
        ),
    };

    Notification {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        message: text,
        time: now,
        read: false,
        target_id: Some(target.id.clone()),
    }
}

/// Persists one notification per incident transition.
pub struct NotificationEmitter {
    store: Arc<dyn HistoryStore>,
}

impl NotificationEmitter {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Failures are logged; the check that triggered the transition still completes.
    pub fn emit(
        &self,
        target: &Target,
        transition: &Transition,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let notification = notification_for(target, transition, message, now);
        tracing::info!("{}", notification.message);

        if let Err(e) = self.store.save_notification(&notification) {
            tracing::error!(
                "Failed to save {} notification for {}: {}",
                notification.kind.as_str(),
                target.name,
                e
            );
        }
    }
}
