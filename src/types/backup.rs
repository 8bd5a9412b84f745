use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable per-project record of the last successful backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMarker {
    pub project: String,
    pub last_backup_timestamp: DateTime<Utc>,
    pub last_backup_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_by: Option<String>,
}
