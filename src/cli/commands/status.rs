use anyhow::{Context, Result};
use chrono::SecondsFormat;

use super::render_table;
use crate::coordinator::DashboardSummary;
use crate::http::CoordinatorClient;

pub struct StatusCommand {
    client: CoordinatorClient,
    json: bool,
}

impl StatusCommand {
    pub fn new(client: CoordinatorClient) -> Self {
        Self { client, json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub async fn execute(&self) -> Result<()> {
        let summary = self
            .client
            .dashboard()
            .await
            .with_context(|| format!("coordinator at {} is not reachable", self.client.base_url()))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("{}", render_status(&summary));
        }
        Ok(())
    }
}

pub fn render_status(summary: &DashboardSummary) -> String {
    let rows: Vec<Vec<String>> = summary
        .agents
        .iter()
        .map(|a| {
            let stale = if summary.stale_agents.contains(&a.id) { " (stale)" } else { "" };
            vec![
                a.id.clone(),
                a.tier.to_string(),
                format!("{}{}", a.status.as_str(), stale),
                a.last_heartbeat.to_rfc3339_opts(SecondsFormat::Secs, true),
                a.capabilities.iter().cloned().collect::<Vec<_>>().join(","),
            ]
        })
        .collect();

    let mut out = Vec::new();
    if rows.is_empty() {
        out.push("No agents registered".to_string());
    } else {
        out.push(render_table(
            &["AGENT", "TIER", "STATUS", "LAST HEARTBEAT", "CAPABILITIES"],
            &rows,
        ));
    }

    let t = &summary.tasks;
    out.push(String::new());
    out.push(format!(
        "Tasks: {} queued, {} claimed, {} running, {} succeeded, {} failed, {} abandoned",
        t.queued, t.claimed, t.running, t.succeeded, t.failed, t.abandoned
    ));

    let by_severity = summary
        .alerts_by_severity
        .iter()
        .map(|(severity, count)| format!("{count} {severity}"))
        .collect::<Vec<_>>();
    if by_severity.is_empty() {
        out.push("Alerts (last hour): none".to_string());
    } else {
        out.push(format!("Alerts (last hour): {}", by_severity.join(", ")));
    }
    out.join("\n")
}
