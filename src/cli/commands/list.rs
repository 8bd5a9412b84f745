use anyhow::{Context, Result};

use super::render_table;
use crate::http::CoordinatorClient;
use crate::supervisor::WorkerStatus;
use crate::types::Tier;

pub struct ListCommand {
    client: CoordinatorClient,
    tier: Option<Tier>,
}

impl ListCommand {
    pub fn new(client: CoordinatorClient) -> Self {
        Self { client, tier: None }
    }

    pub fn with_tier(mut self, tier: Option<Tier>) -> Self {
        self.tier = tier;
        self
    }

    pub async fn execute(&self) -> Result<()> {
        let workers = self
            .client
            .list_workers(self.tier)
            .await
            .context("failed to list workers")?;
        if workers.is_empty() {
            match self.tier {
                Some(tier) => println!("No {tier} workers configured"),
                None => println!("No workers configured"),
            }
        } else {
            println!("{}", render_workers(&workers));
        }
        Ok(())
    }
}

pub fn render_workers(workers: &[WorkerStatus]) -> String {
    let rows: Vec<Vec<String>> = workers
        .iter()
        .map(|w| {
            vec![
                w.id.clone(),
                w.tier.to_string(),
                w.state.to_string(),
                w.breaker.to_string(),
                w.restarts.to_string(),
                w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                w.last_exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    render_table(
        &["WORKER", "TIER", "STATE", "BREAKER", "RESTARTS", "PID", "LAST EXIT"],
        &rows,
    )
}
