//! Externally produced signals read by the merge gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Passed,
    Warning,
    Failed,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Passed => "passed",
            OverallStatus::Warning => "warning",
            OverallStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub project: String,
    pub timestamp: DateTime<Utc>,
    pub overall_status: OverallStatus,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Approved,
    NeedsChanges,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewVerdict {
    pub status: ReviewStatus,
    pub critical_issue_count: u32,
    pub major_issue_count: u32,
    pub minor_issue_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Scope of the review when the verdict directory is shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}
