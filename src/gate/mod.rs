//! Merge gate: combine validation, alert and review signals into one conservative decision.

pub mod decision;
pub mod inputs;

use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::GateConfig;
use crate::coordinator::AlertSource;
use crate::types::Severity;

pub use decision::{decide, AlertSignal, GateDecision, GateOutcome, GatePolicy};
pub use inputs::{load_review_verdict, load_validation_report};

/// Loads the three signals for a project and runs [`decide`] over them
pub struct MergeGate {
    config: GateConfig,
    policy: GatePolicy,
    alerts: Arc<dyn AlertSource>,
    clock: Arc<dyn Clock>,
}

impl MergeGate {
    pub fn new(config: GateConfig, alerts: Arc<dyn AlertSource>) -> Self {
        Self::with_clock(config, alerts, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GateConfig, alerts: Arc<dyn AlertSource>, clock: Arc<dyn Clock>) -> Self {
        let policy = GatePolicy::from_config(&config);
        Self {
            config,
            policy,
            alerts,
            clock,
        }
    }

    /// Never fails: every input problem becomes a denial reason
    pub async fn check(&self, project: &str) -> GateDecision {
        let now = self.clock.now();
        let validation =
            load_validation_report(&self.config.validation_dir, project, now, self.policy.max_clock_skew);
        let review = load_review_verdict(&self.config.review_dir, project, now, self.policy.max_clock_skew);

        let since = now - self.policy.alert_lookback;
        let alerts = match self.alerts.query_alerts(Some(since), Severity::Error).await {
            Ok(alerts) => AlertSignal::Available(alerts),
            Err(e) => {
                warn!(project = %project, error = %e, "Alert query failed, gate will fail closed");
                AlertSignal::Unavailable(e.to_string())
            }
        };

        let decision = decide(validation.as_ref(), &alerts, review.as_ref(), now, &self.policy);
        info!(
            project = %project,
            outcome = %decision.outcome,
            reason = %decision.reason,
            validation_at = ?validation.as_ref().map(|v| v.timestamp),
            review_at = ?review.as_ref().map(|r| r.timestamp),
            "Merge gate decision"
        );
        decision
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::{FleetError, Result};
    use crate::types::Alert;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    struct FixedAlerts(Result<Vec<Alert>>);

    #[async_trait]
    impl AlertSource for FixedAlerts {
        async fn query_alerts(
            &self,
            _since: Option<DateTime<Utc>>,
            _min_severity: Severity,
        ) -> Result<Vec<Alert>> {
            match &self.0 {
                Ok(alerts) => Ok(alerts.clone()),
                Err(e) => Err(FleetError::transport(e.to_string())),
            }
        }
    }

    fn fixture() -> (TempDir, GateConfig, Arc<ManualClock>) {
        let dir = TempDir::new().unwrap();
        let config = GateConfig {
            validation_dir: dir.path().join("validation"),
            review_dir: dir.path().join("review"),
            ..GateConfig::default()
        };
        fs::create_dir_all(&config.validation_dir).unwrap();
        fs::create_dir_all(&config.review_dir).unwrap();
        fs::write(
            config.validation_dir.join("web.json"),
            r#"{"project":"web","timestamp":"2026-03-01T11:40:00Z","overallStatus":"passed"}"#,
        )
        .unwrap();
        fs::write(
            config.review_dir.join("web.json"),
            r#"{"status":"approved","criticalIssueCount":0,"majorIssueCount":0,"minorIssueCount":1,"timestamp":"2026-03-01T11:45:00Z"}"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        (dir, config, clock)
    }

    #[tokio::test]
    async fn test_check_allows_with_fresh_signals() {
        let (_dir, config, clock) = fixture();
        let gate = MergeGate::with_clock(config, Arc::new(FixedAlerts(Ok(Vec::new()))), clock);
        let decision = gate.check("web").await;
        assert_eq!(decision.outcome, GateOutcome::Allow);
    }

    #[tokio::test]
    async fn test_check_fails_closed_when_alerts_unreachable() {
        let (_dir, config, clock) = fixture();
        let source = FixedAlerts(Err(FleetError::transport("connection refused")));
        let gate = MergeGate::with_clock(config, Arc::new(source), clock);
        let decision = gate.check("web").await;
        assert_eq!(decision.outcome, GateOutcome::Deny);
        assert!(decision.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_check_goes_stale_as_time_passes() {
        let (_dir, config, clock) = fixture();
        let gate = MergeGate::with_clock(config, Arc::new(FixedAlerts(Ok(Vec::new()))), clock.clone());
        clock.advance(chrono::Duration::hours(2));
        let decision = gate.check("web").await;
        assert!(decision.reason.starts_with("validation stale"));
    }
}
