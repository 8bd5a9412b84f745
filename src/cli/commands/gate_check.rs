use anyhow::Result;
use std::sync::Arc;

use crate::config::GateConfig;
use crate::coordinator::AlertSource;
use crate::gate::{GateDecision, MergeGate};

pub struct GateCheckCommand {
    gate: MergeGate,
    project: String,
    json: bool,
}

impl GateCheckCommand {
    pub fn new(config: GateConfig, alerts: Arc<dyn AlertSource>, project: impl Into<String>) -> Self {
        Self {
            gate: MergeGate::new(config, alerts),
            project: project.into(),
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Prints the decision and returns the process exit code
    pub async fn execute(&self) -> Result<i32> {
        let decision = self.gate.check(&self.project).await;
        println!("{}", self.render(&decision)?);
        Ok(decision.outcome.exit_code())
    }

    fn render(&self, decision: &GateDecision) -> Result<String> {
        if self.json {
            Ok(serde_json::to_string_pretty(decision)?)
        } else {
            Ok(decision.summary_line())
        }
    }
}
