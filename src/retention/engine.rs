use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compaction::{compact, ArtifactVerifier, CompactionReport, Sha256Verifier};
use super::marker::MarkerStore;
use super::policy::{should_backup, BackupPolicy, TriggerDecision};
use super::snapshot::{create_snapshot, new_snapshot_id, project_size, SNAPSHOT_DIR};
use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::config::{ProjectSpec, RetentionConfig};
use crate::coordinator::AlertSink;
use crate::errors::{FleetError, Result};
use crate::observability::OperationTimer;
use crate::types::{BackupMarker, Severity};

pub const RETENTION_SOURCE: &str = "retention";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum BackupOutcome {
    Skipped {
        decision: TriggerDecision,
    },
    Created {
        snapshot_id: String,
        project_size_bytes: u64,
        archive_size_bytes: u64,
        decision: TriggerDecision,
    },
}

/// Result of one scheduled pass over a project
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRun {
    pub project: String,
    pub backup: Option<BackupOutcome>,
    pub compaction: Option<CompactionReport>,
    pub errors: Vec<String>,
}

/// Owns every write to a project's backup directory.
///
/// All methods are blocking; async callers go through `spawn_blocking`.
pub struct RetentionEngine {
    config: RetentionConfig,
    policy: BackupPolicy,
    verifier: Arc<dyn ArtifactVerifier>,
    clock: Arc<dyn Clock>,
    host: String,
}

impl RetentionEngine {
    pub fn new(config: RetentionConfig) -> Self {
        let policy = BackupPolicy::from_config(&config);
        Self {
            config,
            policy,
            verifier: Arc::new(Sha256Verifier),
            clock: Arc::new(SystemClock),
            host: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ArtifactVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn project(&self, name: &str) -> Result<&ProjectSpec> {
        self.config
            .projects
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| FleetError::not_found("project", name))
    }

    fn project_dir(&self, name: &str) -> Result<PathBuf> {
        let usable = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !usable {
            return Err(FleetError::invalid(format!("project name {name:?} cannot be used as a directory")));
        }
        Ok(self.config.backup_root.join(name))
    }

    /// Run `f` holding the project's exclusive lock; a concurrent run gets `Conflict`
    fn with_project_lock<T>(&self, name: &str, f: impl FnOnce(&PathBuf) -> Result<T>) -> Result<T> {
        let dir = self.project_dir(name)?;
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .try_write()
            .map_err(|_| FleetError::conflict(format!("retention run already in progress for project {name}")))?;
        f(&dir)
    }

    pub fn marker(&self, name: &str) -> Result<Option<BackupMarker>> {
        Ok(MarkerStore::new(&self.project_dir(name)?).read())
    }

    pub fn should_backup(&self, project: &ProjectSpec) -> Result<TriggerDecision> {
        let marker = self.marker(&project.name)?;
        let size = project_size(&project.path, &self.config.backup_root)?;
        Ok(should_backup(marker.as_ref(), size, self.clock.now(), &self.policy))
    }

    /// Snapshot the project when the trigger fires (or always with `force`), then advance the marker
    pub fn backup(&self, project: &ProjectSpec, force: bool) -> Result<BackupOutcome> {
        self.with_project_lock(&project.name, |dir| {
            let markers = MarkerStore::new(dir);
            let now = self.clock.now();
            let size = project_size(&project.path, &self.config.backup_root)?;
            let decision = should_backup(markers.read().as_ref(), size, now, &self.policy);

            if !decision.should_backup() && !force {
                debug!(project = %project.name, ?decision, "Backup throttled");
                return Ok(BackupOutcome::Skipped { decision });
            }

            let snapshot_id = new_snapshot_id(now);
            let archive_size = create_snapshot(
                &project.path,
                &dir.join(SNAPSHOT_DIR),
                &snapshot_id,
                &self.config.backup_root,
            )?;
            markers.write(&BackupMarker {
                project: project.name.clone(),
                last_backup_timestamp: now,
                last_backup_size_bytes: size,
                snapshot_id: Some(snapshot_id.clone()),
                written_by: Some(self.host.clone()),
            })?;

            info!(
                project = %project.name,
                snapshot_id = %snapshot_id,
                project_size_bytes = size,
                archive_size_bytes = archive_size,
                "Backup snapshot created"
            );
            Ok(BackupOutcome::Created {
                snapshot_id,
                project_size_bytes: size,
                archive_size_bytes: archive_size,
                decision,
            })
        })
    }

    pub fn compact(&self, project: &ProjectSpec) -> Result<CompactionReport> {
        self.with_project_lock(&project.name, |dir| {
            let report = compact(
                &dir.join(SNAPSHOT_DIR),
                self.clock.now(),
                chrono_duration(self.config.compaction_age),
                self.config.max_retained_snapshots,
                self.verifier.as_ref(),
            )?;
            info!(
                project = %project.name,
                compressed = report.compressed.len(),
                deleted = report.deleted.len(),
                integrity_failures = report.integrity_failures.len(),
                retained = report.retained,
                "Compaction finished"
            );
            Ok(report)
        })
    }

    /// Backup then compact one project; failures are collected rather than propagated
    pub fn run_project(&self, project: &ProjectSpec) -> ProjectRun {
        let mut run = ProjectRun {
            project: project.name.clone(),
            backup: None,
            compaction: None,
            errors: Vec::new(),
        };
        match self.backup(project, false) {
            Ok(outcome) => run.backup = Some(outcome),
            Err(e) => {
                warn!(project = %project.name, error = %e, "Backup failed");
                run.errors.push(format!("backup failed: {e}"));
            }
        }
        match self.compact(project) {
            Ok(report) => run.compaction = Some(report),
            Err(e) => {
                warn!(project = %project.name, error = %e, "Compaction failed");
                run.errors.push(format!("compaction failed: {e}"));
            }
        }
        run
    }

    pub fn run_once(&self) -> Vec<ProjectRun> {
        let timer = OperationTimer::new("retention_run");
        let runs: Vec<ProjectRun> = self.config.projects.iter().map(|p| self.run_project(p)).collect();
        timer.finish();
        runs
    }
}

/// Publish one alert per integrity failure (critical) and per failed step (error)
pub async fn publish_run_alerts(runs: &[ProjectRun], sink: &dyn AlertSink) {
    for run in runs {
        let integrity = run
            .compaction
            .iter()
            .flat_map(|c| c.integrity_failures.iter())
            .map(|(id, reason)| {
                (
                    Severity::Critical,
                    format!("snapshot {id} of project {} failed verification: {reason}", run.project),
                )
            });
        let failures = run
            .errors
            .iter()
            .map(|e| (Severity::Error, format!("retention run for project {}: {e}", run.project)));

        for (severity, message) in integrity.chain(failures) {
            if let Err(e) = sink.publish_alert(RETENTION_SOURCE, severity, &message).await {
                error!(project = %run.project, error = %e, "Failed to publish retention alert");
            }
        }
    }
}

/// Periodic backup and compaction on the blocking pool, off the request path
pub fn spawn_retention_schedule(
    engine: Arc<RetentionEngine>,
    alerts: Option<Arc<dyn AlertSink>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Retention schedule stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    let runs = match tokio::task::spawn_blocking(move || engine.run_once()).await {
                        Ok(runs) => runs,
                        Err(e) => {
                            error!(error = %e, "Retention run panicked");
                            continue;
                        }
                    };
                    if let Some(sink) = alerts.as_deref() {
                        publish_run_alerts(&runs, sink).await;
                    }
                }
            }
        }
    })
}
