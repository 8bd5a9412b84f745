use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{FleetError, Result};
use crate::types::{Alert, Severity};

/// Append-only alert log with fingerprint deduplication
#[derive(Debug)]
pub struct AlertStore {
    alerts: Vec<Alert>,
    dedup_window: Duration,
    query_horizon: Duration,
    archive_horizon: Duration,
}

/// Result of a publish: the stored alert and whether it was merged
#[derive(Debug, Clone)]
pub struct Published {
    pub alert: Alert,
    pub deduplicated: bool,
}

impl AlertStore {
    pub fn new(dedup_window: Duration, query_horizon: Duration, archive_horizon: Duration) -> Self {
        Self {
            alerts: Vec::new(),
            dedup_window,
            query_horizon,
            archive_horizon: archive_horizon.max(query_horizon),
        }
    }

    /// Insert an alert, or bump the occurrence count of a recent one with the same fingerprint
    pub fn publish(
        &mut self,
        source: &str,
        severity: Severity,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Published> {
        if source.trim().is_empty() {
            return Err(FleetError::invalid("alert source must not be empty"));
        }

        let fingerprint = Alert::fingerprint_for(source, message);
        let window = self.dedup_window;
        let existing = self
            .alerts
            .iter_mut()
            .filter(|a| a.fingerprint == fingerprint)
            .max_by_key(|a| a.timestamp)
            .filter(|a| now - a.timestamp <= window);

        if let Some(alert) = existing {
            alert.occurrences += 1;
            debug!(alert_id = %alert.id, occurrences = alert.occurrences, "Alert deduplicated");
            return Ok(Published {
                alert: alert.clone(),
                deduplicated: true,
            });
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            severity,
            message: message.to_string(),
            timestamp: now,
            fingerprint,
            occurrences: 1,
        };
        info!(alert_id = %alert.id, source = %source, severity = %severity, "Alert published");
        self.alerts.push(alert.clone());
        Ok(Published {
            alert,
            deduplicated: false,
        })
    }

    /// Alerts at or above `min_severity` newer than both `since` and the query horizon, newest first
    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Severity,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let horizon = now - self.query_horizon;
        let cutoff = since.map_or(horizon, |s| s.max(horizon));

        let mut matching: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.timestamp >= cutoff && a.severity >= min_severity)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    /// Drop alerts past the archive horizon
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.archive_horizon;
        let before = self.alerts.len();
        self.alerts.retain(|a| a.timestamp >= cutoff);
        before - self.alerts.len()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
