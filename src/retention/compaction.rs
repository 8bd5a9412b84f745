//! Age-based compression and count-based pruning of snapshots.

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;
use tracing::{error, info};

use super::snapshot::{list_snapshots, SnapshotEntry};
use crate::errors::{FleetError, Result};

/// Confirms a compressed artifact faithfully reproduces its source before the source is removed
#[cfg_attr(test, mockall::automock)]
pub trait ArtifactVerifier: Send + Sync {
    fn verify(&self, original: &Path, compressed: &Path) -> Result<()>;
}

/// Streams both files through SHA-256, decompressing the artifact on the fly
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

fn digest(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl ArtifactVerifier for Sha256Verifier {
    fn verify(&self, original: &Path, compressed: &Path) -> Result<()> {
        let integrity = |reason: String| FleetError::Integrity {
            path: compressed.display().to_string(),
            reason,
        };
        let expected = digest(BufReader::new(File::open(original)?))?;
        let actual = digest(GzDecoder::new(BufReader::new(File::open(compressed)?)))
            .map_err(|e| integrity(format!("decompression failed: {e}")))?;
        if expected != actual {
            return Err(integrity(format!("checksum mismatch: expected {expected}, got {actual}")));
        }
        Ok(())
    }
}

fn compress_file(source: &Path, target: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(target)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub compressed: Vec<String>,
    pub deleted: Vec<String>,
    /// Snapshot id and reason; both forms stay on disk
    pub integrity_failures: Vec<(String, String)>,
    pub retained: usize,
}

/// Compress snapshots older than `compaction_age`, then enforce `max_retained`.
///
/// The raw archive is deleted only after the verifier accepts the compressed copy. Snapshots
/// that failed verification in this run are never pruned by the cap.
pub fn compact(
    dir: &Path,
    now: DateTime<Utc>,
    compaction_age: Duration,
    max_retained: usize,
    verifier: &dyn ArtifactVerifier,
) -> Result<CompactionReport> {
    let mut report = CompactionReport::default();
    let mut failed: BTreeSet<String> = BTreeSet::new();
    let cutoff = now - compaction_age;

    for snapshot in list_snapshots(dir)? {
        let Some(raw) = snapshot.raw.as_ref() else {
            continue;
        };
        if snapshot.created_at > cutoff {
            continue;
        }

        let target = SnapshotEntry::compressed_path(dir, &snapshot.id);
        let outcome = compress_file(raw, &target).and_then(|_| verifier.verify(raw, &target));
        match outcome {
            Ok(()) => {
                fs::remove_file(raw)?;
                info!(snapshot_id = %snapshot.id, "Snapshot compressed and verified");
                report.compressed.push(snapshot.id.clone());
            }
            Err(e) => {
                error!(snapshot_id = %snapshot.id, error = %e, "Snapshot compression not verified, keeping original");
                failed.insert(snapshot.id.clone());
                report.integrity_failures.push((snapshot.id.clone(), e.to_string()));
            }
        }
    }

    let remaining = list_snapshots(dir)?;
    let mut excess = remaining.len().saturating_sub(max_retained);
    for snapshot in &remaining {
        if excess == 0 {
            break;
        }
        if failed.contains(&snapshot.id) {
            continue;
        }
        snapshot.delete()?;
        info!(snapshot_id = %snapshot.id, "Snapshot pruned by retention cap");
        report.deleted.push(snapshot.id.clone());
        excess -= 1;
    }
    report.retained = remaining.len() - report.deleted.len();
    Ok(report)
}
