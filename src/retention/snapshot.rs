//! Snapshot naming, listing, sizing and creation.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{FleetError, Result};

pub const SNAPSHOT_DIR: &str = "snapshots";
const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const RAW_EXT: &str = ".tar";
const COMPRESSED_EXT: &str = ".tar.gz";

/// `YYYYMMDDTHHMMSSZ-<8 hex>`; the prefix is the creation time
pub fn new_snapshot_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format(ID_TIME_FORMAT), &suffix[..8])
}

pub fn parse_snapshot_created(id: &str) -> Option<DateTime<Utc>> {
    let (stamp, suffix) = id.split_once('-')?;
    if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One snapshot as found on disk, in raw and/or compressed form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub raw: Option<PathBuf>,
    pub compressed: Option<PathBuf>,
}

impl SnapshotEntry {
    pub fn raw_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}{RAW_EXT}"))
    }

    pub fn compressed_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}{COMPRESSED_EXT}"))
    }

    /// Remove every form of the snapshot
    pub fn delete(&self) -> Result<()> {
        for path in [&self.raw, &self.compressed].into_iter().flatten() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Snapshots in `dir`, oldest first; ties broken by id. Unrecognised files are ignored.
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotEntry>> {
    let mut by_id: BTreeMap<String, SnapshotEntry> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let (id, compressed) = if let Some(id) = name.strip_suffix(COMPRESSED_EXT) {
            (id, true)
        } else if let Some(id) = name.strip_suffix(RAW_EXT) {
            (id, false)
        } else {
            continue;
        };
        let Some(created_at) = parse_snapshot_created(id) else {
            debug!(path = %path.display(), "Ignoring file with unrecognised snapshot name");
            continue;
        };
        let slot = by_id.entry(id.to_string()).or_insert_with(|| SnapshotEntry {
            id: id.to_string(),
            created_at,
            raw: None,
            compressed: None,
        });
        if compressed {
            slot.compressed = Some(path.clone());
        } else {
            slot.raw = Some(path.clone());
        }
    }

    let mut snapshots: Vec<SnapshotEntry> = by_id.into_values().collect();
    snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(snapshots)
}

fn excluded_root(exclude: &Path) -> Option<PathBuf> {
    exclude.canonicalize().ok()
}

/// Total size of regular files under `root`, skipping anything inside `exclude`
pub fn project_size(root: &Path, exclude: &Path) -> Result<u64> {
    let root = root.canonicalize()?;
    let exclude = excluded_root(exclude);
    let mut total = 0u64;
    let walker = WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| exclude.as_ref().is_none_or(|ex| !e.path().starts_with(ex)));
    for entry in walker {
        let entry = entry.map_err(|e| FleetError::Io(std::io::Error::other(e.to_string())))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Archive `root` into `<dir>/<id>.tar`, returning the archive size.
///
/// The archive is written under a temporary name and renamed into place, so a listed
/// `.tar` is always complete.
pub fn create_snapshot(root: &Path, dir: &Path, id: &str, exclude: &Path) -> Result<u64> {
    fs::create_dir_all(dir)?;
    let root = root.canonicalize()?;
    let exclude = excluded_root(exclude);
    let final_path = SnapshotEntry::raw_path(dir, id);
    let tmp_path = dir.join(format!("{id}{RAW_EXT}.partial"));

    let written = (|| -> Result<()> {
        let file = File::create(&tmp_path)?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.follow_symlinks(false);
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| exclude.as_ref().is_none_or(|ex| !e.path().starts_with(ex)));
        for entry in walker {
            let entry = entry.map_err(|e| FleetError::Io(std::io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| FleetError::Io(std::io::Error::other(e.to_string())))?;
            builder.append_path_with_name(entry.path(), relative)?;
        }
        builder.into_inner()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(fs::metadata(&final_path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_id_round_trips_creation_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 15).unwrap();
        let id = new_snapshot_id(now);
        assert!(id.starts_with("20260301T093015Z-"));
        assert_eq!(parse_snapshot_created(&id), Some(now));
        assert_eq!(parse_snapshot_created("backup-latest"), None);
        assert_eq!(parse_snapshot_created("20260301T093015Z-xyz"), None);
    }

    #[test]
    fn test_list_merges_forms_and_sorts_by_time_then_id() {
        let dir = TempDir::new().unwrap();
        for name in [
            "20260301T100000Z-bbbbbbbb.tar",
            "20260301T100000Z-aaaaaaaa.tar.gz",
            "20260301T090000Z-cccccccc.tar",
            "20260301T090000Z-cccccccc.tar.gz",
            "README.md",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let listed = list_snapshots(dir.path()).unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            ["20260301T090000Z-cccccccc", "20260301T100000Z-aaaaaaaa", "20260301T100000Z-bbbbbbbb"]
        );
        assert!(listed[0].raw.is_some() && listed[0].compressed.is_some());
        assert!(listed[1].raw.is_none());
    }

    #[test]
    fn test_size_and_archive_exclude_backup_root() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), vec![b'a'; 100]).unwrap();
        fs::create_dir_all(project.path().join("src")).unwrap();
        fs::write(project.path().join("src/b.txt"), vec![b'b'; 50]).unwrap();
        let backups = project.path().join(".backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("old.tar"), vec![0u8; 10_000]).unwrap();

        assert_eq!(project_size(project.path(), &backups).unwrap(), 150);

        let snapshots = backups.join("web").join(SNAPSHOT_DIR);
        let id = "20260301T090000Z-0123abcd";
        let size = create_snapshot(project.path(), &snapshots, id, &backups).unwrap();
        assert!(size > 150);

        let mut archive = tar::Archive::new(File::open(SnapshotEntry::raw_path(&snapshots, id)).unwrap());
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["a.txt", "src/b.txt"]);
        assert_eq!(project_size(project.path(), &backups).unwrap(), 150);
    }
}
