use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::warn;

use crate::config::{ProjectSpec, RetentionConfig};
use crate::coordinator::AlertSink;
use crate::retention::{publish_run_alerts, BackupOutcome, ProjectRun, RetentionEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionTask {
    Backup { force: bool },
    Compact,
}

/// One-shot backup or compaction, run on the blocking pool
pub struct RetentionCommand {
    engine: Arc<RetentionEngine>,
    task: RetentionTask,
    project: Option<String>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl RetentionCommand {
    pub fn new(config: RetentionConfig, task: RetentionTask) -> Self {
        Self {
            engine: Arc::new(RetentionEngine::new(config)),
            task,
            project: None,
            alerts: None,
        }
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    /// Integrity failures and step errors are reported here on a best-effort basis
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    fn selected(&self) -> Result<Vec<ProjectSpec>> {
        match &self.project {
            Some(name) => Ok(vec![self.engine.project(name)?.clone()]),
            None if self.engine.config().projects.is_empty() => {
                Err(anyhow!("no projects configured under [[retention.projects]]"))
            }
            None => Ok(self.engine.config().projects.clone()),
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let projects = self.selected()?;
        let engine = self.engine.clone();
        let task = self.task;

        let runs = tokio::task::spawn_blocking(move || {
            projects
                .iter()
                .map(|project| run_task(&engine, project, task))
                .collect::<Vec<_>>()
        })
        .await
        .context("retention task panicked")?;

        for run in &runs {
            println!("{}", describe(run));
        }

        if let Some(sink) = self.alerts.as_deref() {
            publish_run_alerts(&runs, sink).await;
        }

        let failed = runs
            .iter()
            .filter(|r| !r.errors.is_empty() || r.compaction.as_ref().is_some_and(|c| !c.integrity_failures.is_empty()))
            .count();
        if failed > 0 {
            warn!(failed, "Retention finished with failures");
            return Err(anyhow!("{failed} project(s) finished with failures"));
        }
        Ok(())
    }
}

fn run_task(engine: &RetentionEngine, project: &ProjectSpec, task: RetentionTask) -> ProjectRun {
    let mut run = ProjectRun {
        project: project.name.clone(),
        backup: None,
        compaction: None,
        errors: Vec::new(),
    };
    match task {
        RetentionTask::Backup { force } => match engine.backup(project, force) {
            Ok(outcome) => run.backup = Some(outcome),
            Err(e) => run.errors.push(format!("backup failed: {e}")),
        },
        RetentionTask::Compact => match engine.compact(project) {
            Ok(report) => run.compaction = Some(report),
            Err(e) => run.errors.push(format!("compaction failed: {e}")),
        },
    }
    run
}

pub fn describe(run: &ProjectRun) -> String {
    let mut parts = Vec::new();
    match &run.backup {
        Some(BackupOutcome::Created {
            snapshot_id,
            project_size_bytes,
            ..
        }) => parts.push(format!("snapshot {snapshot_id} created ({project_size_bytes} bytes)")),
        Some(BackupOutcome::Skipped { .. }) => parts.push("backup skipped (recent and unchanged)".to_string()),
        None => {}
    }
    if let Some(report) = &run.compaction {
        parts.push(format!(
            "{} compressed, {} deleted, {} retained",
            report.compressed.len(),
            report.deleted.len(),
            report.retained
        ));
        for (id, reason) in &report.integrity_failures {
            parts.push(format!("snapshot {id} kept uncompressed: {reason}"));
        }
    }
    parts.extend(run.errors.iter().cloned());
    format!("{}: {}", run.project, parts.join("; "))
}
