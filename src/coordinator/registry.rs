use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::errors::{FleetError, Result};
use crate::types::{AgentRecord, AgentStatus, Tier};

static AGENT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("agent id pattern is a valid regex")
});

pub fn validate_agent_id(id: &str) -> Result<()> {
    if AGENT_ID.is_match(id) {
        Ok(())
    } else {
        Err(FleetError::invalid(format!(
            "agent id '{id}' must be 1-64 characters of letters, digits, '.', '_' or '-'"
        )))
    }
}

/// Agent table keyed by id
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record. Registration counts as a liveness signal.
    pub fn register(
        &mut self,
        id: &str,
        tier: Tier,
        capabilities: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord> {
        validate_agent_id(id)?;

        let record = match self.agents.get_mut(id) {
            Some(existing) => {
                if !existing.status.is_live() {
                    info!(agent_id = %id, previous = %existing.status, "Agent re-registered and revived");
                }
                existing.tier = tier;
                existing.capabilities = capabilities;
                existing.last_heartbeat = now;
                existing.status = AgentStatus::Healthy;
                existing.clone()
            }
            None => {
                let record = AgentRecord {
                    id: id.to_string(),
                    tier,
                    capabilities,
                    last_heartbeat: now,
                    status: AgentStatus::Healthy,
                    registered_at: now,
                };
                self.agents.insert(id.to_string(), record.clone());
                info!(agent_id = %id, tier = %tier, "Agent registered");
                record
            }
        };
        Ok(record)
    }

    pub fn heartbeat(
        &mut self,
        id: &str,
        hint: Option<AgentStatus>,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord> {
        let status = match hint {
            None => AgentStatus::Healthy,
            Some(s @ (AgentStatus::Healthy | AgentStatus::Degraded | AgentStatus::Starting)) => s,
            Some(other) => {
                return Err(FleetError::invalid(format!(
                    "'{other}' is not a valid heartbeat status"
                )))
            }
        };

        let record = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found("agent", id))?;

        if !record.status.is_live() {
            info!(agent_id = %id, previous = %record.status, status = %status, "Agent recovered on fresh heartbeat");
        }
        record.last_heartbeat = now;
        record.status = status;
        Ok(record.clone())
    }

    pub fn deregister(&mut self, id: &str) -> Result<AgentRecord> {
        let record = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found("agent", id))?;
        record.status = AgentStatus::Stopped;
        info!(agent_id = %id, "Agent marked stopped");
        Ok(record.clone())
    }

    /// Flip live agents whose last heartbeat is older than `timeout`
    pub fn mark_overdue(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut flipped = Vec::new();
        for record in self.agents.values_mut() {
            if record.status.is_live() && now - record.last_heartbeat > timeout {
                warn!(
                    agent_id = %record.id,
                    last_heartbeat = %record.last_heartbeat.to_rfc3339(),
                    "Agent missed heartbeat timeout, marking unresponsive"
                );
                record.status = AgentStatus::Unresponsive;
                flipped.push(record.id.clone());
            }
        }
        flipped
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.agents.get(id).is_some_and(|r| r.status.is_live())
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.agents.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_agent_id_validation() {
        assert!(validate_agent_id("A1").is_ok());
        assert!(validate_agent_id("backup-agent.v2_x").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("-leading").is_err());
        assert!(validate_agent_id("has space").is_err());
        assert!(validate_agent_id(&"a".repeat(64)).is_ok());
        assert!(validate_agent_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut registry = AgentRegistry::new();
        let t0 = Utc::now();
        registry.register("A1", Tier::Core, caps(&["build"]), t0).unwrap();
        let again = registry
            .register("A1", Tier::Core, caps(&["build", "test"]), t0 + Duration::seconds(5))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(again.capabilities, caps(&["build", "test"]));
        assert_eq!(again.registered_at, t0);
    }

    #[test]
    fn test_overdue_agents_flip_and_recover_only_on_heartbeat() {
        let mut registry = AgentRegistry::new();
        let t0 = Utc::now();
        registry.register("A1", Tier::Core, caps(&["build"]), t0).unwrap();

        let timeout = Duration::seconds(180);
        assert!(registry.mark_overdue(t0 + Duration::seconds(180), timeout).is_empty());
        let flipped = registry.mark_overdue(t0 + Duration::seconds(181), timeout);
        assert_eq!(flipped, vec!["A1".to_string()]);
        assert_eq!(registry.get("A1").unwrap().status, AgentStatus::Unresponsive);

        // a second sweep does not report it again
        assert!(registry.mark_overdue(t0 + Duration::seconds(400), timeout).is_empty());

        let record = registry
            .heartbeat("A1", Some(AgentStatus::Degraded), t0 + Duration::seconds(401))
            .unwrap();
        assert_eq!(record.status, AgentStatus::Degraded);
    }

    #[test]
    fn test_heartbeat_rejects_unknown_agents_and_bad_hints() {
        let mut registry = AgentRegistry::new();
        let now = Utc::now();
        assert!(matches!(
            registry.heartbeat("ghost", None, now),
            Err(FleetError::NotFound { .. })
        ));

        registry.register("A1", Tier::Core, caps(&[]), now).unwrap();
        assert!(matches!(
            registry.heartbeat("A1", Some(AgentStatus::Stopped), now),
            Err(FleetError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_deregister_marks_stopped() {
        let mut registry = AgentRegistry::new();
        let now = Utc::now();
        registry.register("A1", Tier::Advanced, caps(&[]), now).unwrap();
        registry.deregister("A1").unwrap();
        assert!(!registry.is_live("A1"));
        assert!(registry.deregister("nope").is_err());
    }
}
