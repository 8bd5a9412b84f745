//! Retention engine: when to snapshot a project and how long snapshots live.
//!
//! Layout under the backup root, one directory per project:
//!
//! ```text
//! <backup_root>/<project>/.backup-marker.json
//! <backup_root>/<project>/.lock
//! <backup_root>/<project>/snapshots/<id>.tar
//! <backup_root>/<project>/snapshots/<id>.tar.gz
//! ```

pub mod compaction;
pub mod engine;
pub mod marker;
pub mod policy;
pub mod snapshot;

pub use compaction::{ArtifactVerifier, CompactionReport, Sha256Verifier};
pub use engine::{
    publish_run_alerts, spawn_retention_schedule, BackupOutcome, ProjectRun, RetentionEngine, RETENTION_SOURCE,
};
pub use marker::MarkerStore;
pub use policy::{percent_delta, should_backup, BackupPolicy, TriggerDecision};
pub use snapshot::{list_snapshots, SnapshotEntry};
