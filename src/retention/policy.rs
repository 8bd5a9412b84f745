//! Backup trigger decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::chrono_duration;
use crate::config::RetentionConfig;
use crate::types::BackupMarker;

#[derive(Debug, Clone, PartialEq)]
pub struct BackupPolicy {
    pub cooldown: Duration,
    pub size_change_threshold: f64,
}

impl BackupPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            cooldown: chrono_duration(config.cooldown),
            size_change_threshold: config.size_change_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum TriggerDecision {
    /// No usable marker yet
    FirstBackup,
    CooldownElapsed { elapsed_secs: i64 },
    SizeChanged { percent_delta: f64 },
    /// Recent backup and an insignificant size change
    Throttled { elapsed_secs: i64, percent_delta: f64 },
}

impl TriggerDecision {
    pub fn should_backup(&self) -> bool {
        !matches!(self, TriggerDecision::Throttled { .. })
    }
}

/// `|current - last| / max(last, 1)`
pub fn percent_delta(current_size: u64, last_size: u64) -> f64 {
    current_size.abs_diff(last_size) as f64 / last_size.max(1) as f64
}

/// Skip only when both throttles agree: the cooldown has not elapsed and the size barely moved.
pub fn should_backup(
    marker: Option<&BackupMarker>,
    current_size: u64,
    now: DateTime<Utc>,
    policy: &BackupPolicy,
) -> TriggerDecision {
    let Some(marker) = marker else {
        return TriggerDecision::FirstBackup;
    };

    let elapsed = now - marker.last_backup_timestamp;
    let delta = percent_delta(current_size, marker.last_backup_size_bytes);
    let within_cooldown = elapsed < policy.cooldown;
    let insignificant = delta < policy.size_change_threshold;

    match (within_cooldown, insignificant) {
        (true, true) => TriggerDecision::Throttled {
            elapsed_secs: elapsed.num_seconds(),
            percent_delta: delta,
        },
        (true, false) => TriggerDecision::SizeChanged { percent_delta: delta },
        (false, _) => TriggerDecision::CooldownElapsed {
            elapsed_secs: elapsed.num_seconds(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> BackupPolicy {
        BackupPolicy {
            cooldown: Duration::seconds(3600),
            size_change_threshold: 0.05,
        }
    }

    fn marker_at(now: DateTime<Utc>, elapsed_secs: i64, size: u64) -> BackupMarker {
        BackupMarker {
            project: "web".to_string(),
            last_backup_timestamp: now - Duration::seconds(elapsed_secs),
            last_backup_size_bytes: size,
            snapshot_id: None,
            written_by: None,
        }
    }

    #[test]
    fn test_throttle_examples() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let size_override = should_backup(Some(&marker_at(now, 1800, 1000)), 1500, now, &policy());
        assert_eq!(size_override, TriggerDecision::SizeChanged { percent_delta: 0.5 });
        assert!(size_override.should_backup());

        let time_override = should_backup(Some(&marker_at(now, 7200, 1000)), 1010, now, &policy());
        assert!(matches!(time_override, TriggerDecision::CooldownElapsed { elapsed_secs: 7200 }));

        let throttled = should_backup(Some(&marker_at(now, 1800, 1000)), 1010, now, &policy());
        assert!(!throttled.should_backup());
    }

    #[test]
    fn test_first_backup_always_proceeds() {
        let now = Utc::now();
        assert_eq!(should_backup(None, 0, now, &policy()), TriggerDecision::FirstBackup);
    }

    #[test]
    fn test_percent_delta_handles_zero_baseline() {
        assert_eq!(percent_delta(0, 0), 0.0);
        assert_eq!(percent_delta(10, 0), 10.0);
        assert_eq!(percent_delta(95, 100), 0.05);
    }
}
