use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::types::{Alert, AgentStatus, Severity};

/// Anything that accepts alerts: the in-process coordinator or a remote client
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert>;
}

/// Read side of the alert store, as seen by the merge gate
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn query_alerts(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Severity,
    ) -> Result<Vec<Alert>>;
}

/// Agent liveness as seen by the supervisor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(None)` when the agent has not registered yet
    async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentStatus>>;

    /// Mark an agent stopped after a clean exit
    async fn deregister(&self, agent_id: &str) -> Result<()>;
}
