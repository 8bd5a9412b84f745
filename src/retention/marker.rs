//! Per-project backup marker, rewritten atomically after each successful snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::Result;
use crate::types::BackupMarker;

pub const MARKER_FILE: &str = ".backup-marker.json";

#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or malformed marker reads as `None`, which triggers a fresh backup
    pub fn read(&self) -> Option<BackupMarker> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Backup marker unreadable");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Backup marker malformed");
                None
            }
        }
    }

    pub fn write(&self, marker: &BackupMarker) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(marker)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
