//! Retention engine lifecycle: throttled backups, verified compaction, capped history

use chrono::{DateTime, Duration, TimeZone, Utc};
use flate2::read::GzDecoder;
use fleetgate::config::{CoordinatorConfig, ProjectSpec, RetentionConfig};
use fleetgate::retention::{
    list_snapshots, publish_run_alerts, should_backup, spawn_retention_schedule, ArtifactVerifier, BackupOutcome,
    BackupPolicy, RetentionEngine, TriggerDecision,
};
use fleetgate::{BackupMarker, Coordinator, FleetError, ManualClock, Result, Severity};
use proptest::prelude::*;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap()
}

struct Workspace {
    _tmp: TempDir,
    clock: Arc<ManualClock>,
    project: ProjectSpec,
    config: RetentionConfig,
}

impl Workspace {
    fn new(max_retained: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("web");
        fs::create_dir_all(source.join("src")).unwrap();
        fs::write(source.join("src/main.rs"), "fn main() {}\n".repeat(50)).unwrap();
        fs::write(source.join("README.md"), "# web\n").unwrap();

        let project = ProjectSpec {
            name: "web".to_string(),
            path: source,
        };
        let config = RetentionConfig {
            backup_root: tmp.path().join("backups"),
            max_retained_snapshots: max_retained,
            projects: vec![project.clone()],
            ..RetentionConfig::default()
        };
        Self {
            _tmp: tmp,
            clock: Arc::new(ManualClock::new(start())),
            project,
            config,
        }
    }

    fn engine(&self) -> RetentionEngine {
        RetentionEngine::new(self.config.clone()).with_clock(self.clock.clone())
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.config.backup_root.join("web").join("snapshots")
    }

    fn touch(&self, extra_bytes: usize) {
        let path = self.project.path.join("notes.txt");
        let mut content = fs::read(&path).unwrap_or_default();
        content.extend(std::iter::repeat_n(b'x', extra_bytes));
        fs::write(path, content).unwrap();
    }
}

/// Accepts nothing, as if every compressed artifact were corrupt
struct RejectingVerifier;

impl ArtifactVerifier for RejectingVerifier {
    fn verify(&self, _original: &Path, compressed: &Path) -> Result<()> {
        Err(FleetError::Integrity {
            path: compressed.display().to_string(),
            reason: "checksum mismatch".to_string(),
        })
    }
}

fn archive_entries(path: &Path) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn test_week_of_backups_compacts_and_caps_history() {
    let ws = Workspace::new(3);
    let engine = ws.engine();

    let mut created = Vec::new();
    for day in 0..5 {
        ws.touch(4096);
        match engine.backup(&ws.project, false).unwrap() {
            BackupOutcome::Created { snapshot_id, .. } => created.push(snapshot_id),
            other => panic!("day {day}: expected a snapshot, got {other:?}"),
        }
        // Unchanged content half an hour later is throttled
        ws.clock.advance(Duration::minutes(30));
        assert!(matches!(
            engine.backup(&ws.project, false).unwrap(),
            BackupOutcome::Skipped {
                decision: TriggerDecision::Throttled { .. }
            }
        ));
        ws.clock.advance(Duration::hours(23) + Duration::minutes(30));
    }
    assert_eq!(list_snapshots(&ws.snapshot_dir()).unwrap().len(), 5);

    let report = engine.compact(&ws.project).unwrap();
    assert_eq!(report.compressed, created);
    assert!(report.integrity_failures.is_empty());
    assert_eq!(report.deleted, created[..2].to_vec());
    assert_eq!(report.retained, 3);

    let remaining = list_snapshots(&ws.snapshot_dir()).unwrap();
    let ids: Vec<&str> = remaining.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, created[2..].iter().map(String::as_str).collect::<Vec<_>>());
    for snapshot in &remaining {
        assert!(snapshot.raw.is_none());
        let compressed = snapshot.compressed.as_ref().unwrap();
        assert_eq!(archive_entries(compressed), ["README.md", "notes.txt", "src/main.rs"]);
    }

    let marker = engine.marker("web").unwrap().unwrap();
    assert_eq!(marker.snapshot_id.as_deref(), Some(created[4].as_str()));
}

#[test]
fn test_compressed_archive_restores_original_bytes() {
    let ws = Workspace::new(10);
    let engine = ws.engine();
    engine.backup(&ws.project, false).unwrap();
    ws.clock.advance(Duration::days(2));
    engine.compact(&ws.project).unwrap();

    let snapshot = list_snapshots(&ws.snapshot_dir()).unwrap().remove(0);
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(snapshot.compressed.unwrap()).unwrap()));
    let mut restored = String::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().ends_with("main.rs") {
            entry.read_to_string(&mut restored).unwrap();
        }
    }
    assert_eq!(restored, "fn main() {}\n".repeat(50));
}

#[tokio::test]
async fn test_failed_verification_keeps_both_forms_and_raises_critical_alert() {
    let mut ws = Workspace::new(1);
    // Long cooldown so the scheduled pass below only compacts
    ws.config.cooldown = std::time::Duration::from_secs(7 * 24 * 3600);
    let engine = ws.engine().with_verifier(Arc::new(RejectingVerifier));
    engine.backup(&ws.project, false).unwrap();
    ws.clock.advance(Duration::hours(2));
    ws.touch(10_000);
    engine.backup(&ws.project, false).unwrap();
    ws.clock.advance(Duration::days(2));

    let runs = engine.run_once();
    assert_eq!(runs.len(), 1);
    assert!(matches!(runs[0].backup, Some(BackupOutcome::Skipped { .. })));
    let compaction = runs[0].compaction.as_ref().unwrap();
    assert!(compaction.compressed.is_empty());
    assert_eq!(compaction.integrity_failures.len(), 2);
    // Nothing verified, so nothing may be pruned even though the cap is exceeded
    assert!(compaction.deleted.is_empty());

    let snapshots = list_snapshots(&ws.snapshot_dir()).unwrap();
    assert_eq!(snapshots.len(), 2);
    for snapshot in &snapshots {
        assert!(snapshot.raw.as_ref().unwrap().exists());
        assert!(snapshot.compressed.as_ref().unwrap().exists());
    }

    let coordinator = Coordinator::new(&CoordinatorConfig::default());
    publish_run_alerts(&runs, &coordinator).await;
    let alerts = coordinator.query_alerts(None, Severity::Critical).await;
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a.source == "retention"));
    assert!(alerts[0].message.contains("failed verification"));
}

#[test]
fn test_failed_backup_does_not_advance_marker() {
    let ws = Workspace::new(5);
    let engine = ws.engine();
    engine.backup(&ws.project, false).unwrap();
    let before = engine.marker("web").unwrap().unwrap();

    // A vanished source fails the run before any snapshot is written
    fs::remove_dir_all(&ws.project.path).unwrap();
    ws.clock.advance(Duration::hours(3));
    assert!(engine.backup(&ws.project, true).is_err());

    assert_eq!(engine.marker("web").unwrap(), Some(before));
    assert_eq!(list_snapshots(&ws.snapshot_dir()).unwrap().len(), 1);
    let leftovers: Vec<_> = fs::read_dir(ws.snapshot_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_backup_root_inside_project_is_not_archived_into_itself() {
    let ws = Workspace::new(5);
    let mut config = ws.config.clone();
    config.backup_root = ws.project.path.join(".backups");
    let engine = RetentionEngine::new(config.clone()).with_clock(ws.clock.clone());

    let first = engine.backup(&ws.project, false).unwrap();
    let BackupOutcome::Created { project_size_bytes, .. } = first else {
        panic!("expected first backup");
    };
    ws.clock.advance(Duration::minutes(5));
    // The new archive inside the project must not count as a size change
    assert!(matches!(
        engine.backup(&ws.project, false).unwrap(),
        BackupOutcome::Skipped { .. }
    ));
    assert_eq!(engine.marker("web").unwrap().unwrap().last_backup_size_bytes, project_size_bytes);
}

#[tokio::test]
async fn test_schedule_runs_immediately_and_stops_on_cancel() {
    let ws = Workspace::new(5);
    let engine = Arc::new(ws.engine());
    let cancel = CancellationToken::new();
    let handle = spawn_retention_schedule(engine.clone(), None, std::time::Duration::from_secs(3600), cancel.clone());

    let mut marker = None;
    for _ in 0..250 {
        marker = engine.marker("web").unwrap();
        if marker.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(marker.map(|m| m.project), Some("web".to_string()));

    cancel.cancel();
    handle.await.unwrap();
}

fn marker(at: DateTime<Utc>, size: u64) -> BackupMarker {
    BackupMarker {
        project: "web".to_string(),
        last_backup_timestamp: at,
        last_backup_size_bytes: size,
        snapshot_id: None,
        written_by: None,
    }
}

proptest! {
    #[test]
    fn prop_throttled_iff_recent_and_insignificant(
        elapsed_mins in 0i64..240,
        last in 0u64..1_000_000,
        current in 0u64..1_000_000,
    ) {
        let policy = BackupPolicy {
            cooldown: Duration::hours(1),
            size_change_threshold: 0.05,
        };
        let now = start();
        let decision = should_backup(Some(&marker(now - Duration::minutes(elapsed_mins), last)), current, now, &policy);

        let recent = elapsed_mins < 60;
        let delta = current.abs_diff(last) as f64 / last.max(1) as f64;
        prop_assert_eq!(!decision.should_backup(), recent && delta < 0.05);
    }

    #[test]
    fn prop_no_marker_always_backs_up(current in any::<u64>()) {
        let decision = should_backup(None, current, start(), &BackupPolicy {
            cooldown: Duration::hours(1),
            size_change_threshold: 0.05,
        });
        prop_assert_eq!(decision, TriggerDecision::FirstBackup);
    }
}
