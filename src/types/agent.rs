use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Worker tiers, ordered by how strongly the supervisor keeps them alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Always running
    Core,
    /// Runs on a schedule
    Maintenance,
    /// Started by request, reaped when idle
    OnDemand,
    /// Operator managed
    Advanced,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Core => "core",
            Tier::Maintenance => "maintenance",
            Tier::OnDemand => "on-demand",
            Tier::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Ok(Tier::Core),
            "maintenance" => Ok(Tier::Maintenance),
            "on-demand" | "on_demand" | "ondemand" => Ok(Tier::OnDemand),
            "advanced" => Ok(Tier::Advanced),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Healthy,
    Degraded,
    Unresponsive,
    Stopped,
}

impl AgentStatus {
    /// Live agents may hold and acquire work
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AgentStatus::Starting | AgentStatus::Healthy | AgentStatus::Degraded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unresponsive => "unresponsive",
            AgentStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One registered worker as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub tier: Tier,
    pub capabilities: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }
}
