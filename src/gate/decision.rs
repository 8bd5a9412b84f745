//! The three-signal merge decision.
//!
//! Everything here is pure: no I/O, no clock reads, no state. Callers pass `now` and the
//! signals they loaded, so the same inputs always produce the same [`GateDecision`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::chrono_duration;
use crate::config::GateConfig;
use crate::types::{Alert, OverallStatus, ReviewStatus, ReviewVerdict, Severity, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Allow,
    AllowWithWarning,
    Deny,
}

impl GateOutcome {
    /// Process exit code for scripts: 0 allow, 1 deny, 2 allow with warning
    pub fn exit_code(self) -> i32 {
        match self {
            GateOutcome::Allow => 0,
            GateOutcome::Deny => 1,
            GateOutcome::AllowWithWarning => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GateOutcome::Allow => "ALLOW",
            GateOutcome::AllowWithWarning => "ALLOW-WITH-WARNING",
            GateOutcome::Deny => "DENY",
        }
    }

    pub fn permits_merge(self) -> bool {
        !matches!(self, GateOutcome::Deny)
    }
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub outcome: GateOutcome,
    pub reason: String,
    pub checked_at: DateTime<Utc>,
}

impl GateDecision {
    fn new(outcome: GateOutcome, reason: impl Into<String>, checked_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
            checked_at,
        }
    }

    /// The single line printed for operators, e.g. `DENY: unresolved alert: ...`
    pub fn summary_line(&self) -> String {
        format!("{}: {}", self.outcome.label(), self.reason)
    }
}

/// The alert signal as seen by the gate. A failed query is data, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertSignal {
    Available(Vec<Alert>),
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub max_age: Duration,
    pub alert_lookback: Duration,
    pub max_clock_skew: Duration,
}

impl GatePolicy {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            max_age: chrono_duration(config.max_age),
            alert_lookback: chrono_duration(config.alert_lookback),
            max_clock_skew: chrono_duration(config.max_clock_skew),
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

enum Freshness {
    Fresh,
    Stale(Duration),
    Future(Duration),
}

fn freshness(timestamp: DateTime<Utc>, now: DateTime<Utc>, policy: &GatePolicy) -> Freshness {
    let age = now - timestamp;
    if age > policy.max_age {
        Freshness::Stale(age)
    } else if -age > policy.max_clock_skew {
        Freshness::Future(-age)
    } else {
        Freshness::Fresh
    }
}

fn human(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        s if s >= 3600 && s % 3600 == 0 => format!("{}h", s / 3600),
        s if s >= 3600 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

/// Decide whether a change may merge.
///
/// Checks run strictly in order: validation, alerts, review. The first failing check wins.
pub fn decide(
    validation: Option<&ValidationReport>,
    alerts: &AlertSignal,
    review: Option<&ReviewVerdict>,
    now: DateTime<Utc>,
    policy: &GatePolicy,
) -> GateDecision {
    let deny = |reason: String| GateDecision::new(GateOutcome::Deny, reason, now);

    let Some(report) = validation else {
        return deny("validation missing: no usable validation report".to_string());
    };
    match freshness(report.timestamp, now, policy) {
        Freshness::Stale(age) => {
            return deny(format!(
                "validation stale: report is {} old (max {})",
                human(age),
                human(policy.max_age)
            ))
        }
        Freshness::Future(ahead) => {
            return deny(format!(
                "validation missing: report timestamp is {} in the future",
                human(ahead)
            ))
        }
        Freshness::Fresh => {}
    }
    if report.overall_status != OverallStatus::Passed {
        let failing: Vec<&str> = report
            .checks
            .iter()
            .filter(|(_, check)| check.status != "passed")
            .map(|(name, _)| name.as_str())
            .collect();
        let mut reason = format!(
            "validation failed: overall status is {}",
            report.overall_status.as_str()
        );
        if !failing.is_empty() {
            reason.push_str(&format!(" ({})", failing.join(", ")));
        }
        return deny(reason);
    }

    match alerts {
        AlertSignal::Unavailable(error) => {
            return deny(format!("unresolved alert: alert signal unavailable ({error})"));
        }
        AlertSignal::Available(alerts) => {
            let cutoff = now - policy.alert_lookback;
            let mut blocking: Vec<&Alert> = alerts
                .iter()
                .filter(|a| a.severity >= Severity::Error && a.timestamp >= cutoff)
                .collect();
            if !blocking.is_empty() {
                blocking.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
                let latest = blocking[0];
                return deny(format!(
                    "unresolved alert: {} error/critical alert(s) in the last {}; latest [{}] {}: {}",
                    blocking.len(),
                    human(policy.alert_lookback),
                    latest.severity,
                    latest.source,
                    latest.message
                ));
            }
        }
    }

    let Some(verdict) = review else {
        return deny("review missing: no usable review verdict".to_string());
    };
    match freshness(verdict.timestamp, now, policy) {
        Freshness::Stale(age) => {
            return deny(format!(
                "review missing: verdict is {} old (max {})",
                human(age),
                human(policy.max_age)
            ))
        }
        Freshness::Future(ahead) => {
            return deny(format!(
                "review missing: verdict timestamp is {} in the future",
                human(ahead)
            ))
        }
        Freshness::Fresh => {}
    }
    if verdict.status == ReviewStatus::Blocked {
        return deny("review blocked: reviewer blocked the change".to_string());
    }
    if verdict.critical_issue_count > 0 {
        return deny(format!(
            "review blocked: {} critical issue(s) reported",
            verdict.critical_issue_count
        ));
    }

    if verdict.status == ReviewStatus::NeedsChanges {
        return GateDecision::new(
            GateOutcome::AllowWithWarning,
            format!(
                "review needs changes: {} major, {} minor issue(s) need human attention",
                verdict.major_issue_count, verdict.minor_issue_count
            ),
            now,
        );
    }

    GateDecision::new(
        GateOutcome::Allow,
        "validation passed, no unresolved alerts, review approved",
        now,
    )
}
