//! File adapter feeding the decision function.
//!
//! Reports and verdicts are JSON documents dropped into a directory. The newest document by
//! embedded timestamp wins; anything unreadable or malformed is skipped. A document dated too
//! far in the future still counts as the newest, so it can never uncover an older one.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::{ReviewVerdict, ValidationReport};

/// Paths of `*.json` files directly inside `dir`, sorted for stable tie-breaking
fn json_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Signal directory not readable");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable signal file");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping malformed signal file");
            None
        }
    }
}

/// Newest document in `dir` accepted by `keep`, judged by `timestamp_of`
fn latest<T, F, K>(dir: &Path, now: DateTime<Utc>, max_clock_skew: Duration, timestamp_of: F, keep: K) -> Option<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> DateTime<Utc>,
    K: Fn(&T) -> bool,
{
    let mut best: Option<T> = None;
    for path in json_files(dir) {
        let Some(doc) = parse_file::<T>(&path) else {
            continue;
        };
        if !keep(&doc) {
            continue;
        }
        let ts = timestamp_of(&doc);
        if ts - now > max_clock_skew {
            // Kept so it outranks older documents; the decision denies on it
            warn!(path = %path.display(), timestamp = %ts, "Signal file dated in the future");
        }
        // Later files win ties so the sort order above is the tie-breaker
        if best.as_ref().is_none_or(|b| ts >= timestamp_of(b)) {
            best = Some(doc);
        }
    }
    best
}

pub fn load_validation_report(
    dir: &Path,
    project: &str,
    now: DateTime<Utc>,
    max_clock_skew: Duration,
) -> Option<ValidationReport> {
    latest(
        dir,
        now,
        max_clock_skew,
        |r: &ValidationReport| r.timestamp,
        |r| r.project == project,
    )
}

/// Verdicts without a `project` field apply to every project sharing the directory
pub fn load_review_verdict(
    dir: &Path,
    project: &str,
    now: DateTime<Utc>,
    max_clock_skew: Duration,
) -> Option<ReviewVerdict> {
    latest(
        dir,
        now,
        max_clock_skew,
        |v: &ReviewVerdict| v.timestamp,
        |v| v.project.as_deref().is_none_or(|p| p == project),
    )
}
