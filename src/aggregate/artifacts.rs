//! Derived artifacts on disk
//!
//! Every file goes through [`write_atomic`], so a reader sees either the old
//! content or the new content. Data-bearing files are only rewritten when their
//! bytes change, which keeps their modification time meaningful for freshness.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::HistoricalSeries;
use crate::error::AggregateError;

pub const HISTORICAL_FILE: &str = "historical.json";
pub const RECENT_FILE: &str = "recent.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const INDEX_FILE: &str = "index.json";

/// Files that carry series data (as opposed to summaries)
pub const CORE_ARTIFACTS: [&str; 4] = [HISTORICAL_FILE, RECENT_FILE, METADATA_FILE, INDEX_FILE];

pub fn daily_file_name(date: NaiveDate) -> String {
    format!("output_{}.json", date.format("%Y-%m-%d"))
}

/// Date encoded in a daily archive name, if it is one
pub fn parse_daily_file_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix("output_")?.strip_suffix(".json")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn is_artifact_file(name: &str) -> bool {
    CORE_ARTIFACTS.contains(&name) || parse_daily_file_name(name).is_some()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Summary of one aggregation pass; recomputed every time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub generated_at: DateTime<Utc>,
    pub total_points: usize,
    pub time_range: TimeRange,
    /// Valid-point count per window, keyed `ma_N`
    pub valid_counts: BTreeMap<String, usize>,
    pub historical_bytes: u64,
    pub recent_points: usize,
    pub recent_hours: i64,
    pub cadence_seconds: i64,
    pub shards_read: usize,
    pub shards_skipped: usize,
    #[serde(default)]
    pub daily_files: Vec<String>,
}

impl Metadata {
    /// Load a previously written metadata.json
    pub fn load(dir: &Path) -> Option<Self> {
        let content = fs::read(dir.join(METADATA_FILE)).ok()?;
        serde_json::from_slice(&content).ok()
    }
}

/// Counts gathered while building the series
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildStats {
    pub shards_read: usize,
    pub shards_skipped: usize,
}

/// What one write pass produced
#[derive(Debug, Clone)]
pub struct WrittenArtifacts {
    pub metadata: Metadata,
    /// Files whose content changed in this pass
    pub changed: Vec<String>,
}

/// Write `bytes` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AggregateError> {
    let io_err = |source| AggregateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err)
}

/// Write unless the file already holds exactly these bytes
fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<bool, AggregateError> {
    if let Ok(existing) = fs::read(path) {
        if existing == bytes {
            return Ok(false);
        }
    }
    write_atomic(path, bytes)?;
    Ok(true)
}

fn to_json<T: Serialize + ?Sized>(value: &T, artifact: &'static str) -> Result<Vec<u8>, AggregateError> {
    serde_json::to_vec(value).map_err(|source| AggregateError::Serialize { artifact, source })
}

fn to_json_pretty<T: Serialize + ?Sized>(
    value: &T,
    artifact: &'static str,
) -> Result<Vec<u8>, AggregateError> {
    serde_json::to_vec_pretty(value).map_err(|source| AggregateError::Serialize { artifact, source })
}

/// Persist the full artifact set for a non-empty series
pub fn write_all(
    dir: &Path,
    series: &HistoricalSeries,
    recent_hours: i64,
    cadence_seconds: i64,
    stats: BuildStats,
) -> Result<WrittenArtifacts, AggregateError> {
    let time_range = series.time_range().ok_or(AggregateError::NoDataAvailable {
        shards_seen: stats.shards_read + stats.shards_skipped,
    })?;
    let mut changed = Vec::new();

    let mut daily_files = Vec::new();
    for (date, points) in series.daily_groups() {
        let name = daily_file_name(date);
        let bytes = to_json(points, "daily archive")?;
        if write_if_changed(&dir.join(&name), &bytes)? {
            changed.push(name.clone());
        }
        daily_files.push(name);
    }

    let historical = to_json(series.points(), "historical series")?;
    let historical_bytes = historical.len() as u64;
    if write_if_changed(&dir.join(HISTORICAL_FILE), &historical)? {
        changed.push(HISTORICAL_FILE.to_string());
    }

    let recent = series.recent(recent_hours);
    let recent_bytes = to_json(recent, "recent series")?;
    if write_if_changed(&dir.join(RECENT_FILE), &recent_bytes)? {
        changed.push(RECENT_FILE.to_string());
    }

    let generated_at = Utc::now();
    let metadata = Metadata {
        generated_at,
        total_points: series.len(),
        time_range,
        valid_counts: series.valid_counts(),
        historical_bytes,
        recent_points: recent.len(),
        recent_hours,
        cadence_seconds,
        shards_read: stats.shards_read,
        shards_skipped: stats.shards_skipped,
        daily_files: daily_files.clone(),
    };
    write_atomic(&dir.join(METADATA_FILE), &to_json_pretty(&metadata, "metadata")?)?;
    changed.push(METADATA_FILE.to_string());

    let index = serde_json::json!({
        "generated_at": generated_at,
        "data_sources": {
            "recent": {
                "file": RECENT_FILE,
                "description": format!("Last {} hours of {}-second data", recent_hours, cadence_seconds),
                "records": recent.len(),
            },
            "historical": {
                "file": HISTORICAL_FILE,
                "description": "Complete resampled series",
                "records": series.len(),
            },
            "daily_archives": {
                "files": daily_files,
                "format": "output_YYYY-MM-DD.json",
            },
        },
        "metadata": METADATA_FILE,
    });
    write_atomic(&dir.join(INDEX_FILE), &to_json_pretty(&index, "index")?)?;
    changed.push(INDEX_FILE.to_string());

    debug!("Artifacts changed this pass: {:?}", changed);
    info!(
        "Wrote {} points ({} bytes), {} recent, {} daily archives",
        metadata.total_points,
        historical_bytes,
        metadata.recent_points,
        metadata.daily_files.len()
    );

    Ok(WrittenArtifacts { metadata, changed })
}

/// Artifact files currently present in `dir`
pub fn list_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(is_artifact_file)
                        .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_file_names() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 10).unwrap();
        assert_eq!(daily_file_name(date), "output_2025-07-10.json");
        assert_eq!(parse_daily_file_name("output_2025-07-10.json"), Some(date));
        assert_eq!(parse_daily_file_name("output_latest.json"), None);
        assert!(is_artifact_file("historical.json"));
        assert!(!is_artifact_file("backup-summary.json"));
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("historical.json");
        write_atomic(&path, b"[1]").unwrap();
        write_atomic(&path, b"[1,2]").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"[1,2]");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_if_changed_skips_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recent.json");
        assert!(write_if_changed(&path, b"[]").unwrap());
        assert!(!write_if_changed(&path, b"[]").unwrap());
        assert!(write_if_changed(&path, b"[0]").unwrap());
    }
}
