use anyhow::{Context, Result};

use crate::http::CoordinatorClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Start,
    Stop,
    Restart,
    Probe,
}

impl WorkerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerAction::Start => "start",
            WorkerAction::Stop => "stop",
            WorkerAction::Restart => "restart",
            WorkerAction::Probe => "probe",
        }
    }
}

pub struct WorkerCommand {
    client: CoordinatorClient,
    action: WorkerAction,
    worker_id: String,
}

impl WorkerCommand {
    pub fn new(client: CoordinatorClient, action: WorkerAction, worker_id: impl Into<String>) -> Self {
        Self {
            client,
            action,
            worker_id: worker_id.into(),
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let status = self
            .client
            .worker_action(&self.worker_id, self.action.as_str())
            .await
            .with_context(|| format!("{} of worker {} failed", self.action.as_str(), self.worker_id))?;

        let pid = status.pid.map(|p| format!(", pid {p}")).unwrap_or_default();
        println!(
            "worker {}: {} (breaker {}, restarts {}{})",
            status.id, status.state, status.breaker, status.restarts, pid
        );
        Ok(())
    }
}
