//! Single source of truth for agent liveness, task state and alerts.
//!
//! All state lives in one [`CoordinatorState`] behind one async mutex, so every
//! mutation is linearizable. Reads copy what they need and release the lock.

pub mod alerts;
pub mod queue;
pub mod registry;
pub mod sweep;
pub mod traits;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::errors::{FleetError, Result};
use crate::observability::{FleetMetrics, FleetStats, OperationTimer};
use crate::types::{AgentRecord, AgentStatus, Alert, Severity, Task, TaskState, Tier};

pub use alerts::AlertStore;
pub use queue::{TaskCounts, TaskQueue};
pub use registry::AgentRegistry;
pub use sweep::{spawn_sweeper, SweepReport};
pub use traits::{AlertSink, AlertSource, HealthProbe};

pub const COORDINATOR_SOURCE: &str = "coordinator";

#[derive(Debug)]
struct CoordinatorState {
    registry: AgentRegistry,
    queue: TaskQueue,
    alerts: AlertStore,
}

/// Time-based rules, converted once from configuration
#[derive(Debug, Clone)]
struct Limits {
    heartbeat_timeout: Duration,
    max_retries: u32,
    task_retention: Duration,
    stale_agent_threshold: Duration,
}

pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    limits: Limits,
    clock: Arc<dyn Clock>,
    metrics: FleetMetrics,
}

/// Read model for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub agents: Vec<AgentRecord>,
    pub agent_counts: BTreeMap<String, usize>,
    pub stale_agents: Vec<String>,
    pub tasks: TaskCounts,
    pub recent_alerts: Vec<Alert>,
    pub alerts_by_severity: BTreeMap<String, usize>,
    pub metrics: FleetStats,
    pub last_update: DateTime<Utc>,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        let state = CoordinatorState {
            registry: AgentRegistry::new(),
            queue: TaskQueue::new(),
            alerts: AlertStore::new(
                chrono_duration(config.alert_dedup_window),
                chrono_duration(config.alert_query_horizon),
                chrono_duration(config.alert_archive_horizon),
            ),
        };
        Self {
            state: Mutex::new(state),
            limits: Limits {
                heartbeat_timeout: chrono_duration(config.heartbeat_timeout),
                max_retries: config.max_retries.max(1),
                task_retention: chrono_duration(config.task_retention),
                stale_agent_threshold: chrono_duration(config.stale_agent_threshold),
            },
            clock,
            metrics: FleetMetrics::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    pub async fn register(
        &self,
        agent_id: &str,
        tier: Tier,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<AgentRecord> {
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        let now = self.clock.now();
        let record = self
            .state
            .lock()
            .await
            .registry
            .register(agent_id, tier, capabilities, now)?;
        self.metrics.record_registration();
        Ok(record)
    }

    pub async fn heartbeat(&self, agent_id: &str, hint: Option<AgentStatus>) -> Result<AgentRecord> {
        let now = self.clock.now();
        let record = self.state.lock().await.registry.heartbeat(agent_id, hint, now)?;
        self.metrics.record_heartbeat();
        Ok(record)
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<AgentRecord> {
        self.state.lock().await.registry.deregister(agent_id)
    }

    pub async fn enqueue_task(&self, task_type: &str, payload: serde_json::Value) -> Result<Task> {
        let now = self.clock.now();
        let task = self.state.lock().await.queue.enqueue(task_type, payload, now)?;
        self.metrics.record_enqueue();
        Ok(task)
    }

    /// Oldest queued task of an accepted type the agent registered a capability for, or `None`
    pub async fn claim_task(&self, agent_id: &str, accepted_types: &[String]) -> Result<Option<Task>> {
        let mut state = self.state.lock().await;
        let record = state
            .registry
            .get(agent_id)
            .ok_or_else(|| FleetError::not_found("agent", agent_id))?;
        if !record.status.is_live() {
            self.metrics.record_conflict();
            return Err(FleetError::conflict(format!(
                "agent {agent_id} is {} and may not claim work",
                record.status
            )));
        }

        let eligible: Vec<String> = accepted_types
            .iter()
            .filter(|t| record.can_handle(t))
            .cloned()
            .collect();
        if eligible.len() < accepted_types.len() {
            debug!(agent_id, requested = ?accepted_types, eligible = ?eligible, "Dropped task types outside agent capabilities");
        }

        let claimed = state.queue.claim(agent_id, &eligible);
        if claimed.is_some() {
            self.metrics.record_claim();
        }
        Ok(claimed)
    }

    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let result = self.state.lock().await.queue.start(task_id, agent_id);
        if matches!(result, Err(FleetError::Conflict { .. })) {
            self.metrics.record_conflict();
        }
        result
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Result<Task> {
        let now = self.clock.now();
        let outcome = self
            .state
            .lock()
            .await
            .queue
            .complete(task_id, agent_id, result, success, now);
        match &outcome {
            Ok(_) => self.metrics.record_completion(),
            Err(FleetError::Conflict { .. }) => self.metrics.record_conflict(),
            Err(_) => {}
        }
        outcome
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.state
            .lock()
            .await
            .queue
            .get(task_id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("task", task_id))
    }

    pub async fn list_tasks(&self, state: Option<TaskState>) -> Vec<Task> {
        self.state.lock().await.queue.list(state)
    }

    pub async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert> {
        let now = self.clock.now();
        let published = self
            .state
            .lock()
            .await
            .alerts
            .publish(source, severity, message, now)?;
        self.metrics.record_alert(published.deduplicated);
        Ok(published.alert)
    }

    pub async fn query_alerts(&self, since: Option<DateTime<Utc>>, min_severity: Severity) -> Vec<Alert> {
        let now = self.clock.now();
        self.state.lock().await.alerts.query(since, min_severity, now)
    }

    pub async fn query_agent_health(&self) -> Vec<AgentRecord> {
        self.state.lock().await.registry.list()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.state.lock().await.registry.get(agent_id).cloned()
    }

    /// One reclaim pass: flag silent agents, take their work back, prune old alerts and tasks
    pub async fn sweep(&self) -> SweepReport {
        let timer = OperationTimer::new("sweep");
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let CoordinatorState {
            registry,
            queue,
            alerts,
        } = &mut *state;

        let marked_unresponsive = registry.mark_overdue(now, self.limits.heartbeat_timeout);
        let outcome = queue.reclaim(|agent| registry.is_live(agent), self.limits.max_retries, now);

        let mut abandoned = Vec::with_capacity(outcome.abandoned.len());
        for (task, holder) in &outcome.abandoned {
            let message = format!(
                "task {} ({}) abandoned after {} attempts; last held by {}",
                task.id, task.task_type, task.attempts, holder
            );
            match alerts.publish(COORDINATOR_SOURCE, Severity::Error, &message, now) {
                Ok(published) => self.metrics.record_alert(published.deduplicated),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to publish abandonment alert"),
            }
            abandoned.push(task.id.clone());
        }
        let pruned_alerts = alerts.prune(now);
        let pruned_tasks = queue.prune_finished(now - self.limits.task_retention);
        drop(state);

        self.metrics.record_reclaim(outcome.requeued.len() as u64);
        self.metrics.record_abandoned(abandoned.len() as u64);

        let report = SweepReport {
            marked_unresponsive,
            requeued: outcome.requeued,
            abandoned,
            pruned_alerts,
            pruned_tasks,
        };
        if !report.is_empty() {
            info!(
                unresponsive = report.marked_unresponsive.len(),
                requeued = report.requeued.len(),
                abandoned = report.abandoned.len(),
                pruned_alerts = report.pruned_alerts,
                pruned_tasks = report.pruned_tasks,
                "Reclaim sweep completed"
            );
        }
        timer.finish();
        report
    }

    pub async fn dashboard(&self) -> DashboardSummary {
        let now = self.clock.now();
        let (agents, tasks, recent_alerts) = {
            let state = self.state.lock().await;
            (
                state.registry.list(),
                state.queue.counts(),
                state.alerts.query(Some(now - Duration::hours(1)), Severity::Info, now),
            )
        };

        let mut agent_counts = BTreeMap::new();
        let mut stale_agents = Vec::new();
        for agent in &agents {
            *agent_counts.entry(agent.status.to_string()).or_insert(0) += 1;
            if agent.status != AgentStatus::Stopped
                && now - agent.last_heartbeat > self.limits.stale_agent_threshold
            {
                stale_agents.push(agent.id.clone());
            }
        }

        let mut alerts_by_severity = BTreeMap::new();
        for alert in &recent_alerts {
            *alerts_by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
        }

        DashboardSummary {
            agents,
            agent_counts,
            stale_agents,
            tasks,
            recent_alerts,
            alerts_by_severity,
            metrics: self.metrics.get_stats(),
            last_update: now,
        }
    }
}

#[async_trait]
impl AlertSink for Coordinator {
    async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert> {
        Coordinator::publish_alert(self, source, severity, message).await
    }
}

#[async_trait]
impl AlertSource for Coordinator {
    async fn query_alerts(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Severity,
    ) -> Result<Vec<Alert>> {
        Ok(Coordinator::query_alerts(self, since, min_severity).await)
    }
}

#[async_trait]
impl HealthProbe for Coordinator {
    async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        Ok(self.agent(agent_id).await.map(|a| a.status))
    }

    async fn deregister(&self, agent_id: &str) -> Result<()> {
        Coordinator::deregister(self, agent_id).await.map(|_| ())
    }
}
