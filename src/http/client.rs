use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::server::{ClaimResponse, HealthResponse};
use super::ApiEnvelope;
use crate::coordinator::{AlertSink, AlertSource, DashboardSummary, HealthProbe};
use crate::errors::{FleetError, Result};
use crate::supervisor::WorkerStatus;
use crate::types::{AgentRecord, AgentStatus, Alert, Severity, Task, TaskState, Tier};

/// HTTP client for the coordinator API
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
}

impl CoordinatorClient {
    /// Create a client; every request is bounded by `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the envelope, mapping business statuses to typed errors
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let http_status = response.status();
        let envelope: ApiEnvelope<T> = response.json().await.map_err(|e| {
            FleetError::transport(format!("undecodable response (HTTP {http_status}): {e}"))
        })?;

        let message = envelope.message.unwrap_or_default();
        match envelope.status.as_str() {
            "ok" => envelope
                .data
                .ok_or_else(|| FleetError::transport("response carried no data")),
            "not_found" => Err(FleetError::NotFound {
                kind: "resource",
                id: message,
            }),
            "conflict" => Err(FleetError::Conflict { reason: message }),
            "invalid" => Err(FleetError::InvalidRequest { reason: message }),
            other => {
                debug!(status = %other, http_status = %http_status, "Coordinator reported an error");
                Err(FleetError::transport(format!("coordinator error: {message}")))
            }
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.send(self.http.get(self.url("/health"))).await
    }

    pub async fn dashboard(&self) -> Result<DashboardSummary> {
        self.send(self.http.get(self.url("/api/dashboard-data"))).await
    }

    pub async fn register(&self, agent_id: &str, tier: Tier, capabilities: &[&str]) -> Result<AgentRecord> {
        let body = json!({ "agentId": agent_id, "tier": tier, "capabilities": capabilities });
        self.send(self.http.post(self.url("/agents/register")).json(&body)).await
    }

    pub async fn heartbeat(&self, agent_id: &str, hint: Option<AgentStatus>) -> Result<AgentRecord> {
        let body = json!({ "statusHint": hint });
        self.send(self.http.post(self.url(&format!("/agents/{agent_id}/heartbeat"))).json(&body))
            .await
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<AgentRecord> {
        self.send(self.http.post(self.url(&format!("/agents/{agent_id}/deregister"))))
            .await
    }

    pub async fn query_agent_health(&self) -> Result<Vec<AgentRecord>> {
        self.send(self.http.get(self.url("/agents"))).await
    }

    pub async fn enqueue_task(&self, task_type: &str, payload: serde_json::Value) -> Result<Task> {
        let body = json!({ "type": task_type, "payload": payload });
        self.send(self.http.post(self.url("/tasks")).json(&body)).await
    }

    pub async fn claim_task(&self, agent_id: &str, accepted_types: &[&str]) -> Result<Option<Task>> {
        let body = json!({ "agentId": agent_id, "acceptedTypes": accepted_types });
        let response: ClaimResponse = self.send(self.http.post(self.url("/tasks/claim")).json(&body)).await?;
        Ok(response.task)
    }

    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let body = json!({ "agentId": agent_id });
        self.send(self.http.post(self.url(&format!("/tasks/{task_id}/start"))).json(&body))
            .await
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Result<Task> {
        let body = json!({ "agentId": agent_id, "result": result, "success": success });
        self.send(self.http.post(self.url(&format!("/tasks/{task_id}/complete"))).json(&body))
            .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.send(self.http.get(self.url(&format!("/tasks/{task_id}")))).await
    }

    pub async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let mut request = self.http.get(self.url("/tasks"));
        if let Some(state) = state {
            request = request.query(&[("state", state.as_str())]);
        }
        self.send(request).await
    }

    pub async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert> {
        let body = json!({ "source": source, "severity": severity, "message": message });
        self.send(self.http.post(self.url("/alerts")).json(&body)).await
    }

    pub async fn query_alerts(&self, since: Option<DateTime<Utc>>, min_severity: Severity) -> Result<Vec<Alert>> {
        let mut params = vec![("minSeverity", min_severity.as_str().to_string())];
        if let Some(since) = since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }
        self.send(self.http.get(self.url("/alerts")).query(&params)).await
    }

    pub async fn list_workers(&self, tier: Option<Tier>) -> Result<Vec<WorkerStatus>> {
        let mut request = self.http.get(self.url("/workers"));
        if let Some(tier) = tier {
            request = request.query(&[("tier", tier.as_str())]);
        }
        self.send(request).await
    }

    pub async fn worker_status(&self, worker_id: &str) -> Result<WorkerStatus> {
        self.send(self.http.get(self.url(&format!("/workers/{worker_id}")))).await
    }

    /// Run a worker control verb: start, stop, restart or probe
    pub async fn worker_action(&self, worker_id: &str, action: &str) -> Result<WorkerStatus> {
        self.send(self.http.post(self.url(&format!("/workers/{worker_id}/{action}"))))
            .await
    }
}

#[async_trait]
impl AlertSink for CoordinatorClient {
    async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert> {
        CoordinatorClient::publish_alert(self, source, severity, message).await
    }
}

#[async_trait]
impl AlertSource for CoordinatorClient {
    async fn query_alerts(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Severity,
    ) -> Result<Vec<Alert>> {
        CoordinatorClient::query_alerts(self, since, min_severity).await
    }
}

#[async_trait]
impl HealthProbe for CoordinatorClient {
    async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let agents = self.query_agent_health().await?;
        Ok(agents.into_iter().find(|a| a.id == agent_id).map(|a| a.status))
    }

    async fn deregister(&self, agent_id: &str) -> Result<()> {
        CoordinatorClient::deregister(self, agent_id).await.map(|_| ())
    }
}
